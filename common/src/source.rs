use anyhow::{anyhow, bail};
use glob::glob;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;

use crate::error::{EngineError, EngineResult};
use crate::partition::{Locator, Partition};
use crate::record::{Record, Records};

/* =========================
   Parsers de registros
   ========================= */

/// Convierte una línea cruda en un registro estructurado.
/// El esquema concreto no le importa al motor.
pub trait RecordParser: Send + Sync {
    fn parse(&self, raw: &str) -> anyhow::Result<Record>;
}

/// Línea de texto -> `{"text": <línea>}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextLineParser;

impl RecordParser for TextLineParser {
    fn parse(&self, raw: &str) -> anyhow::Result<Record> {
        Ok(json!({ "text": raw }))
    }
}

/// Una línea = un objeto JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineParser;

impl RecordParser for JsonLineParser {
    fn parse(&self, raw: &str) -> anyhow::Result<Record> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// CSV con encabezados. Los valores quedan como strings.
#[derive(Debug, Clone)]
pub struct CsvLineParser {
    headers: Vec<String>,
}

fn csv_fields(raw: &str) -> anyhow::Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(raw.as_bytes());
    let rec = reader
        .records()
        .next()
        .transpose()?
        .ok_or_else(|| anyhow!("línea CSV vacía"))?;
    // Limpia BOM por si viene de Excel/Windows
    Ok(rec
        .iter()
        .map(|s| s.trim().trim_start_matches('\u{feff}').to_string())
        .collect())
}

impl CsvLineParser {
    pub fn new(headers: Vec<String>) -> Self {
        Self { headers }
    }

    pub fn from_header_line(line: &str) -> anyhow::Result<Self> {
        let headers = csv_fields(line)?;
        if headers.iter().all(|h| h.is_empty()) {
            bail!("encabezado CSV vacío");
        }
        Ok(Self { headers })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl RecordParser for CsvLineParser {
    fn parse(&self, raw: &str) -> anyhow::Result<Record> {
        let cols = csv_fields(raw)?;
        if cols.len() > self.headers.len() {
            bail!(
                "{} columnas pero el encabezado tiene {}",
                cols.len(),
                self.headers.len()
            );
        }
        let mut obj = serde_json::Map::new();
        for (idx, h) in self.headers.iter().enumerate() {
            let val = cols.get(idx).map(String::as_str).unwrap_or("");
            obj.insert(h.clone(), json!(val));
        }
        Ok(Value::Object(obj))
    }
}

/// Formato de las líneas de un archivo de entrada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    #[default]
    Text,
    Jsonl,
    Csv,
}

impl RecordFormat {
    /// Infere el formato por extensión; por defecto texto.
    pub fn from_path(path: &str) -> Self {
        let ext = std::path::Path::new(path)
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "csv" => RecordFormat::Csv,
            "json" | "jsonl" => RecordFormat::Jsonl,
            _ => RecordFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    /// Si es true, un último registro sin `\n` final es un error
    /// (`MalformedBoundary`) en vez de aceptarse.
    pub require_terminator: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            require_terminator: true,
        }
    }
}

impl SourceOptions {
    pub fn lenient() -> Self {
        Self {
            require_terminator: false,
        }
    }
}

/* =========================
   Particionado de archivos de texto
   ========================= */

/// Corta `bytes` en hasta `num_partitions` rangos `[start, end)` contiguos.
/// Cada corte se corre hacia adelante hasta justo después del siguiente `\n`,
/// así ninguna partición termina a mitad de un registro.
fn line_aligned_ranges(bytes: &[u8], num_partitions: u32) -> Vec<(usize, usize)> {
    let len = bytes.len();
    let n = num_partitions.max(1) as usize;
    let mut ranges = Vec::new();
    let mut start = 0;

    for i in 1..=n {
        if start >= len {
            break;
        }
        let target = if i == n { len } else { (len * i / n).max(start) };
        let end = if target >= len {
            len
        } else {
            let from = target.saturating_sub(1).max(start);
            match bytes[from..].iter().position(|b| *b == b'\n') {
                Some(p) => from + p + 1,
                None => len,
            }
        };
        ranges.push((start, end));
        start = end;
    }

    ranges
}

/// Cómo se leen las líneas de un formato.
#[derive(Debug, Clone, Copy)]
struct LineLayout {
    /// La primera línea del archivo es encabezado
    header: bool,
    /// Las líneas en blanco no son registros (JSONL, CSV). En texto toda
    /// línea es un registro, aunque esté vacía.
    skip_blank: bool,
}

impl RecordFormat {
    fn layout(self) -> LineLayout {
        match self {
            RecordFormat::Text => LineLayout {
                header: false,
                skip_blank: false,
            },
            RecordFormat::Jsonl => LineLayout {
                header: false,
                skip_blank: true,
            },
            RecordFormat::Csv => LineLayout {
                header: true,
                skip_blank: true,
            },
        }
    }
}

fn split_bytes(
    path: &str,
    bytes: &[u8],
    first_id: u32,
    num_partitions: u32,
    parser: &dyn RecordParser,
    layout: LineLayout,
    opts: &SourceOptions,
) -> EngineResult<Vec<Partition>> {
    if opts.require_terminator && bytes.last().is_some_and(|b| *b != b'\n') {
        let offset = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|p| p + 1)
            .unwrap_or(0);
        return Err(EngineError::MalformedBoundary {
            locator: path.to_string(),
            offset: offset as u64,
        });
    }

    let mut out = Vec::new();
    let mut line_no: u64 = 0;
    let mut header_pending = layout.header;

    for (idx, (start, end)) in line_aligned_ranges(bytes, num_partitions)
        .into_iter()
        .enumerate()
    {
        let text = std::str::from_utf8(&bytes[start..end]).map_err(|e| EngineError::ParseError {
            line: line_no + 1,
            reason: format!("UTF-8 inválido: {e}"),
        })?;

        let mut records: Records = Vec::new();
        for line in text.split_terminator('\n') {
            line_no += 1;
            let line = line.strip_suffix('\r').unwrap_or(line);
            if header_pending {
                header_pending = false;
                continue;
            }
            if layout.skip_blank && line.trim().is_empty() {
                continue;
            }
            let rec = parser.parse(line).map_err(|e| EngineError::ParseError {
                line: line_no,
                reason: format!("{e:#}"),
            })?;
            records.push(rec);
        }

        out.push(Partition::new(
            first_id + idx as u32,
            Locator::ByteRange {
                path: path.to_string(),
                start: start as u64,
                end: end as u64,
            },
            records,
        ));
    }

    Ok(out)
}

fn read_source(path: &str) -> EngineResult<Vec<u8>> {
    fs::read(path).map_err(|e| EngineError::SourceUnavailable {
        locator: path.to_string(),
        reason: e.to_string(),
    })
}

/// Particiona un archivo orientado a líneas usando un parser arbitrario.
pub fn text_file(
    path: &str,
    num_partitions: u32,
    parser: &dyn RecordParser,
    opts: &SourceOptions,
) -> EngineResult<Vec<Partition>> {
    let bytes = read_source(path)?;
    split_bytes(path, &bytes, 0, num_partitions, parser, RecordFormat::Text.layout(), opts)
}

fn read_file_from(
    path: &str,
    first_id: u32,
    num_partitions: u32,
    format: RecordFormat,
    opts: &SourceOptions,
) -> EngineResult<Vec<Partition>> {
    let bytes = read_source(path)?;
    let layout = format.layout();
    match format {
        RecordFormat::Text => split_bytes(path, &bytes, first_id, num_partitions, &TextLineParser, layout, opts),
        RecordFormat::Jsonl => split_bytes(path, &bytes, first_id, num_partitions, &JsonLineParser, layout, opts),
        RecordFormat::Csv => {
            // asumiendo primera línea = encabezados
            let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
            let header = String::from_utf8_lossy(first_line);
            let header = header.trim_end_matches('\r');
            if header.trim().is_empty() {
                return Ok(Vec::new());
            }
            let parser = CsvLineParser::from_header_line(header).map_err(|e| EngineError::ParseError {
                line: 1,
                reason: format!("{e:#}"),
            })?;
            split_bytes(path, &bytes, first_id, num_partitions, &parser, layout, opts)
        }
    }
}

/// Particiona un archivo según su formato (texto, JSONL o CSV con encabezado).
pub fn read_file(
    path: &str,
    num_partitions: u32,
    format: RecordFormat,
    opts: &SourceOptions,
) -> EngineResult<Vec<Partition>> {
    read_file_from(path, 0, num_partitions, format, opts)
}

/// Expande un patrón glob y particiona cada archivo (orden lexicográfico).
/// Los ids de partición son globales y consecutivos.
pub fn read_glob(
    pattern: &str,
    partitions_per_file: u32,
    format: RecordFormat,
    opts: &SourceOptions,
) -> EngineResult<Vec<Partition>> {
    let entries = glob(pattern).map_err(|e| EngineError::SourceUnavailable {
        locator: pattern.to_string(),
        reason: format!("patrón inválido: {e}"),
    })?;

    let mut files: Vec<String> = entries
        .flatten()
        .filter(|p| p.is_file())
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(EngineError::SourceUnavailable {
            locator: pattern.to_string(),
            reason: "ningún archivo coincide".to_string(),
        });
    }

    let mut out = Vec::new();
    for path in files {
        let next_id = out.len() as u32;
        out.extend(read_file_from(&path, next_id, partitions_per_file, format, opts)?);
    }
    Ok(out)
}

/* =========================
   Particionado en memoria
   ========================= */

/// Reparte registros en memoria en `num_partitions` trozos contiguos.
pub fn from_records(records: Records, num_partitions: u32) -> Vec<Partition> {
    let n = num_partitions.max(1) as usize;
    let chunk = records.len().div_ceil(n).max(1);
    chunk_records(records, chunk)
}

/// Igual que `from_records` pero indicando el máximo de registros por partición.
pub fn with_size_hint(records: Records, max_records: usize) -> Vec<Partition> {
    chunk_records(records, max_records.max(1))
}

fn chunk_records(records: Records, chunk: usize) -> Vec<Partition> {
    let mut out = Vec::new();
    let mut offset = 0;
    let mut iter = records.into_iter().peekable();

    while iter.peek().is_some() {
        let part: Records = iter.by_ref().take(chunk).collect();
        let len = part.len();
        out.push(Partition::new(
            out.len() as u32,
            Locator::Memory { offset, len },
            part,
        ));
        offset += len;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::concat;
    use std::{env, io::Write, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("source_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn write_file(path: &PathBuf, content: &str) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn rangos_alineados_cubren_todo_sin_huecos() {
        let bytes = b"uno\ndos\ntres largo\ncuatro\ncinco\n";
        for n in 1..=9 {
            let ranges = line_aligned_ranges(bytes, n);
            assert_eq!(ranges.first().unwrap().0, 0);
            assert_eq!(ranges.last().unwrap().1, bytes.len());
            for w in ranges.windows(2) {
                assert_eq!(w[0].1, w[1].0);
            }
            for (_, end) in &ranges {
                assert_eq!(bytes[end - 1], b'\n', "corte a mitad de registro con n={n}");
            }
        }
    }

    #[test]
    fn concatenar_particiones_reconstruye_el_archivo() {
        let tmp = temp_dir("concat");
        let path = tmp.join("in.txt");
        let lines: Vec<String> = (0..37).map(|i| format!("linea numero {i}")).collect();
        write_file(&path, &format!("{}\n", lines.join("\n")));

        for n in [1, 2, 3, 5, 8, 50] {
            let parts = text_file(
                path.to_str().unwrap(),
                n,
                &TextLineParser,
                &SourceOptions::default(),
            )
            .unwrap();
            assert!(parts.len() as u32 <= n);
            let got: Vec<String> = concat(&parts)
                .iter()
                .map(|r| r["text"].as_str().unwrap().to_string())
                .collect();
            assert_eq!(got, lines, "n={n}");
        }

        // las líneas en blanco también son registros de texto
        let blanks = tmp.join("blancos.txt");
        write_file(&blanks, "a\n\nb\n   \nc\n\n");
        for n in [1, 2, 3, 6] {
            let parts = text_file(
                blanks.to_str().unwrap(),
                n,
                &TextLineParser,
                &SourceOptions::default(),
            )
            .unwrap();
            let got: Vec<String> = concat(&parts)
                .iter()
                .map(|r| r["text"].as_str().unwrap().to_string())
                .collect();
            assert_eq!(got, vec!["a", "", "b", "   ", "c", ""], "n={n}");
        }
    }

    #[test]
    fn jsonl_y_csv_saltean_lineas_en_blanco() {
        let tmp = temp_dir("blank_structured");
        let jsonl = tmp.join("data.jsonl");
        write_file(&jsonl, "{\"x\":1}\n\n  \n{\"x\":2}\n");
        let parts = read_file(jsonl.to_str().unwrap(), 2, RecordFormat::Jsonl, &SourceOptions::default())
            .unwrap();
        assert_eq!(concat(&parts), vec![json!({"x": 1}), json!({"x": 2})]);

        let csv = tmp.join("data.csv");
        write_file(&csv, "id\n1\n\n2\n");
        let parts = read_file(csv.to_str().unwrap(), 1, RecordFormat::Csv, &SourceOptions::default())
            .unwrap();
        assert_eq!(concat(&parts), vec![json!({"id": "1"}), json!({"id": "2"})]);
    }

    #[test]
    fn ultimo_registro_sin_terminador_falla_en_modo_estricto() {
        let tmp = temp_dir("strict");
        let path = tmp.join("in.txt");
        write_file(&path, "a\nb\nc");

        let err = text_file(path.to_str().unwrap(), 2, &TextLineParser, &SourceOptions::default())
            .unwrap_err();
        match err {
            EngineError::MalformedBoundary { offset, .. } => assert_eq!(offset, 4),
            other => panic!("error inesperado: {other:?}"),
        }

        let parts = text_file(path.to_str().unwrap(), 2, &TextLineParser, &SourceOptions::lenient())
            .unwrap();
        assert_eq!(concat(&parts).len(), 3);
    }

    #[test]
    fn archivo_inexistente_es_source_unavailable() {
        let err = text_file(
            "/no/existe/input.txt",
            2,
            &TextLineParser,
            &SourceOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable { .. }));
    }

    #[test]
    fn archivo_vacio_no_genera_particiones() {
        let tmp = temp_dir("empty");
        let path = tmp.join("in.txt");
        write_file(&path, "");
        let parts = text_file(path.to_str().unwrap(), 4, &TextLineParser, &SourceOptions::default())
            .unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn csv_usa_encabezado_y_respeta_comillas() {
        let tmp = temp_dir("csv");
        let path = tmp.join("data.csv");
        write_file(&path, "id,text\n1,\"hola, mundo\"\n2,chau\n");

        let parts = read_file(path.to_str().unwrap(), 2, RecordFormat::Csv, &SourceOptions::default())
            .unwrap();
        let recs = concat(&parts);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0]["id"], json!("1"));
        assert_eq!(recs[0]["text"], json!("hola, mundo"));
        assert_eq!(recs[1]["text"], json!("chau"));
    }

    #[test]
    fn jsonl_mal_formado_reporta_linea() {
        let tmp = temp_dir("jsonl_bad");
        let path = tmp.join("data.jsonl");
        write_file(&path, "{\"x\":1}\n{roto\n");

        let err = read_file(path.to_str().unwrap(), 1, RecordFormat::Jsonl, &SourceOptions::default())
            .unwrap_err();
        match err {
            EngineError::ParseError { line, .. } => assert_eq!(line, 2),
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[test]
    fn glob_numera_particiones_de_forma_global() {
        let tmp = temp_dir("glob");
        write_file(&tmp.join("a.txt"), "1\n2\n3\n4\n");
        write_file(&tmp.join("b.txt"), "5\n6\n");
        let pattern = format!("{}/*.txt", tmp.display());

        let parts = read_glob(&pattern, 2, RecordFormat::Text, &SourceOptions::default()).unwrap();
        let ids: Vec<u32> = parts.iter().map(|p| p.id).collect();
        assert_eq!(ids, (0..parts.len() as u32).collect::<Vec<_>>());
        let texts: Vec<String> = concat(&parts)
            .iter()
            .map(|r| r["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["1", "2", "3", "4", "5", "6"]);

        let none = read_glob(
            &format!("{}/*.nada", tmp.display()),
            2,
            RecordFormat::Text,
            &SourceOptions::default(),
        );
        assert!(matches!(none, Err(EngineError::SourceUnavailable { .. })));
    }

    #[test]
    fn from_records_reparte_en_trozos_contiguos() {
        let recs: Records = (0..10).map(|i| json!(i)).collect();
        let parts = from_records(recs.clone(), 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 4);
        assert_eq!(parts[2].len(), 2);
        assert_eq!(concat(&parts), recs);

        let parts = with_size_hint(recs.clone(), 5);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].locator, Locator::Memory { offset: 5, len: 5 });

        assert!(from_records(Vec::new(), 4).is_empty());
    }

    #[test]
    fn record_format_por_extension() {
        assert_eq!(RecordFormat::from_path("x/y.CSV"), RecordFormat::Csv);
        assert_eq!(RecordFormat::from_path("y.jsonl"), RecordFormat::Jsonl);
        assert_eq!(RecordFormat::from_path("y.txt"), RecordFormat::Text);
    }
}
