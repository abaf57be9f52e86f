use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use common::source::RecordFormat;
use common::{
    Extractor, FlowGraph, JobInfo, JobRequest, JobResults, PersistedInfo, SourceSpec,
    StorageDirective, WorkerMetrics,
};
use reqwest::{Client, Response};
use serde::Deserialize;
use std::{env, fs};

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Directive {
    None,
    Memory,
    Disk,
}

impl From<Directive> for StorageDirective {
    fn from(d: Directive) -> Self {
        match d {
            Directive::None => StorageDirective::None,
            Directive::Memory => StorageDirective::Memory,
            Directive::Disk => StorageDirective::Disk,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un job: WordCount sobre un glob, o un grafo JSON arbitrario
    Submit {
        #[arg(value_name = "NOMBRE")]
        name: String,

        /// Patrón de archivos de entrada
        #[arg(long, default_value = "/data/input/*.txt")]
        input: String,

        /// Particiones por archivo
        #[arg(long, default_value_t = 4)]
        partitions: u32,

        /// Archivo JSON con el grafo (si falta, WordCount)
        #[arg(long)]
        graph: Option<String>,

        /// Leer desde un flujo persistido en vez del glob
        #[arg(long)]
        persisted: Option<String>,

        /// Aceptar un último registro sin salto de línea
        #[arg(long)]
        lenient: bool,

        #[arg(long, value_enum, default_value = "none")]
        persist: Directive,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Muestra el resultado de un job terminado
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Cancela un job en curso
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    Workers,

    /// Lista los flujos persistidos
    Persisted,

    /// Suelta una referencia a un flujo persistido
    Release {
        #[arg(value_name = "HANDLE")]
        handle: String,
    },
}

#[derive(Deserialize)]
struct ReleaseResponse {
    handle: String,
    refs: u32,
}

/// WordCount: collect(tokenize) -> filter(nonempty_token)
/// -> key_by(token, count) -> sum_by_key
pub fn build_wordcount_graph() -> Result<FlowGraph> {
    let graph = FlowGraph::new()
        .collect("tokenize")?
        .filter("nonempty_token")?
        .key_by(Extractor::field("token"), Extractor::field("count"))?
        .sum_by_key()?;
    Ok(graph)
}

fn build_request(
    name: String,
    input: String,
    partitions: u32,
    graph: Option<String>,
    persisted: Option<String>,
    lenient: bool,
    directive: StorageDirective,
) -> Result<JobRequest> {
    let graph = match graph {
        Some(path) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("no se pudo leer el grafo {path}"))?;
            serde_json::from_str::<FlowGraph>(&raw).with_context(|| format!("grafo inválido en {path}"))?
        }
        None => build_wordcount_graph()?,
    };

    let source = match persisted {
        Some(handle) => SourceSpec::Persisted {
            handle: common::PersistHandle(handle),
        },
        None => SourceSpec::TextGlob {
            format: Some(RecordFormat::from_path(&input)),
            pattern: input,
            partitions,
            lenient,
        },
    };

    Ok(JobRequest {
        name,
        graph,
        source,
        directive,
    })
}

/// Devuelve el cuerpo de error del master como `anyhow`.
async fn check(resp: Response, what: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let msg = body["error"].as_str().unwrap_or("sin detalle").to_string();
    bail!("{what}: status {status}: {msg}")
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {:?}", job.status);
    println!("  grafo: {}", job.graph.describe());

    // métricas de tareas
    println!(
        "  tareas: total={}, completadas={}, fallidas={}, reintentos={}",
        job.total_tasks, job.completed_tasks, job.failed_tasks, job.retries
    );
    if job.total_tasks > 0 {
        println!("  progreso: {:.1}%", job.progress().fraction() * 100.0);
    } else {
        println!("  progreso: (sin tareas)");
    }

    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref started) = job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(ref err) = job.error {
        println!("  error: {}", err);
    }
    if let Some(ref h) = job.persisted {
        println!("  persistido como: {}", h);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            name,
            input,
            partitions,
            graph,
            persisted,
            lenient,
            persist,
        } => {
            let url = format!("{}/api/v1/jobs", base_url);
            let req = build_request(name, input, partitions, graph, persisted, lenient, persist.into())?;

            let resp = client.post(&url).json(&req).send().await?;
            let job_info: JobInfo = check(resp, "no se pudo crear el job").await?.json().await?;

            println!("Job creado:");
            println!("  id: {}", job_info.id);
            println!("  nombre: {}", job_info.name);
            println!("  estado: {:?}", job_info.status);
            println!("  particiones: {}", job_info.total_tasks);
            println!("  submitted_at: {}", job_info.submitted_at);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            let job: JobInfo = check(resp, "job no encontrado").await?.json().await?;
            print_job(&job);
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/jobs/{id}/results", base_url);
            let resp = client.get(&url).send().await?;
            let results: JobResults = check(resp, "resultados no disponibles").await?.json().await?;

            println!("Resultados para job {} ({:?}):", results.job_id, results.status);
            match results.result {
                Some(res) => {
                    for (label, value) in res.to_pairs() {
                        println!("  {label}: {value}");
                    }
                    if let Some(h) = res.persisted {
                        println!("  persistido como: {}", h);
                    }
                }
                None => match results.error {
                    Some(err) => println!("  error: {err}"),
                    None => println!("  (sin resultado)"),
                },
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/jobs/{id}/cancel", base_url);
            let resp = client.post(&url).send().await?;
            let job: JobInfo = check(resp, "no se pudo cancelar").await?.json().await?;
            println!("Job {} -> {:?}", job.id, job.status);
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            let workers: Vec<WorkerMetrics> =
                check(resp, "error consultando /api/v1/workers").await?.json().await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!(
                    "  concurrency    : max={}, activas={}",
                    w.max_concurrency, w.active_tasks
                );
                println!(
                    "  tareas         : started={}, ok={}, failed={}",
                    w.tasks_started, w.tasks_succeeded, w.tasks_failed
                );
                match w.avg_task_ms {
                    Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
                    None => println!("  avg_task_ms    : (sin datos)"),
                }
                match w.cpu_percent {
                    Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                    None => println!("  cpu_percent    : (sin datos)"),
                }
                match w.mem_bytes {
                    Some(mem) => println!("  mem_bytes      : {}", mem),
                    None => println!("  mem_bytes      : (sin datos)"),
                }
                println!();
            }
        }

        Commands::Persisted => {
            let url = format!("{}/api/v1/persisted", base_url);
            let resp = client.get(&url).send().await?;
            let flows: Vec<PersistedInfo> = check(resp, "error consultando persistidos").await?.json().await?;
            if flows.is_empty() {
                println!("No hay flujos persistidos.");
            }
            for f in flows {
                println!(
                    "{}  {}  tier={}  refs={}  particiones={}  registros={}  bytes={}",
                    f.handle, f.name, f.tier, f.refs, f.partitions, f.records, f.bytes
                );
            }
        }

        Commands::Release { handle } => {
            let url = format!("{}/api/v1/persisted/{handle}", base_url);
            let resp = client.delete(&url).send().await?;
            let out: ReleaseResponse = check(resp, "no se pudo liberar").await?.json().await?;
            if out.refs == 0 {
                println!("{} liberado", out.handle);
            } else {
                println!("{}: quedan {} referencias", out.handle, out.refs);
            }
        }
    }

    Ok(())
}
