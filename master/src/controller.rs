use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use common::{
    merge_all, Accumulator, EngineError, EngineResult, FlowGraph, JobId, JobInfo, JobOutput,
    JobResult, JobResults, JobStatus, Locator, Partition, PartitionOutput, PersistHandle,
    Progress, StorageDirective, Task, WorkerId,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::state::JobShared;

/// Referencia a un job enviado.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    id: JobId,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Estado observado sin bloquear.
#[derive(Debug, Clone)]
pub enum JobPoll {
    Running,
    Completed(JobResult),
    Failed(EngineError),
    Cancelled,
}

/// Salida de una partición ya ejecutada, con el worker que la produjo.
struct Finished {
    partition: u32,
    worker: WorkerId,
    output: PartitionOutput,
}

/// Planifica grafos sobre los workers de la sesión y sigue su avance.
pub struct JobController {
    session: Arc<Session>,
    jobs: Mutex<HashMap<JobId, Arc<JobShared>>>,
}

impl JobController {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, Arc<JobShared>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn job(&self, handle: &JobHandle) -> EngineResult<Arc<JobShared>> {
        self.jobs()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownJob(handle.id.clone()))
    }

    /// Handle de un job ya enviado, a partir de su id.
    pub fn find(&self, id: &str) -> EngineResult<JobHandle> {
        if self.jobs().contains_key(id) {
            Ok(JobHandle { id: id.to_string() })
        } else {
            Err(EngineError::UnknownJob(id.to_string()))
        }
    }

    pub fn submit(
        &self,
        graph: FlowGraph,
        partitions: Vec<Partition>,
        directive: StorageDirective,
    ) -> EngineResult<JobHandle> {
        let name = graph.describe();
        self.submit_named(&name, graph, partitions, directive)
    }

    /// Valida el grafo y lanza el job en segundo plano. Debe llamarse dentro
    /// de un runtime de tokio.
    pub fn submit_named(
        &self,
        name: &str,
        graph: FlowGraph,
        partitions: Vec<Partition>,
        directive: StorageDirective,
    ) -> EngineResult<JobHandle> {
        graph.validate(self.session.registry())?;
        if !partitions.is_empty() && self.session.pool().alive().is_empty() {
            return Err(EngineError::NoWorkers);
        }

        // mientras corre el job, los flujos persistidos que usa como fuente
        // no se liberan
        let inputs: Vec<PersistHandle> = partitions
            .iter()
            .filter_map(|p| match &p.locator {
                Locator::Persisted { handle, .. } => Some(handle.clone()),
                _ => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for (i, h) in inputs.iter().enumerate() {
            if let Err(e) = self.session.store().acquire(h) {
                for acquired in &inputs[..i] {
                    let _ = self.session.store().release(acquired);
                }
                return Err(e);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let info = JobInfo::new(
            id.clone(),
            name.to_string(),
            graph.clone(),
            directive,
            partitions.len() as u32,
        );
        let job = Arc::new(JobShared::new(info));
        self.jobs().insert(id.clone(), Arc::clone(&job));
        self.forget_finished();

        info!(
            "job {} ({}) enviado: {} particiones, directiva {:?}",
            id,
            name,
            partitions.len(),
            directive
        );

        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let outcome = drive(&session, &job, Arc::new(graph), partitions, directive).await;
            for h in &inputs {
                let _ = session.store().release(h);
            }
            finalize(&session, &job, outcome);
        });

        Ok(JobHandle { id })
    }

    pub fn poll(&self, handle: &JobHandle) -> EngineResult<JobPoll> {
        let job = self.job(handle)?;
        let st = job.lock();
        Ok(match st.info.status {
            JobStatus::Submitted | JobStatus::Running => JobPoll::Running,
            JobStatus::Completed => match &st.result {
                Some(r) => JobPoll::Completed(r.clone()),
                None => JobPoll::Running,
            },
            JobStatus::Failed => JobPoll::Failed(
                st.error
                    .clone()
                    .unwrap_or_else(|| EngineError::partition_failed(0, "causa desconocida")),
            ),
            JobStatus::Cancelled => JobPoll::Cancelled,
        })
    }

    /// Espera a que el job termine.
    pub async fn wait(&self, handle: &JobHandle) -> EngineResult<JobResult> {
        let job = self.job(handle)?;
        let mut rx = job.subscribe();
        rx.wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| EngineError::UnknownJob(handle.id.clone()))?;

        match self.poll(handle)? {
            JobPoll::Completed(result) => Ok(result),
            JobPoll::Failed(e) => Err(e),
            JobPoll::Cancelled => Err(EngineError::Cancelled),
            JobPoll::Running => Err(EngineError::UnknownJob(handle.id.clone())),
        }
    }

    pub fn progress(&self, handle: &JobHandle) -> EngineResult<Progress> {
        Ok(self.job(handle)?.lock().info.progress())
    }

    /// Devuelve false si el job ya había terminado.
    pub fn cancel(&self, handle: &JobHandle) -> EngineResult<bool> {
        let job = self.job(handle)?;
        let cancelled = job.cancel();
        if cancelled {
            info!("job {} cancelado", handle.id);
        }
        Ok(cancelled)
    }

    pub async fn run(
        &self,
        graph: FlowGraph,
        partitions: Vec<Partition>,
        directive: StorageDirective,
    ) -> EngineResult<JobResult> {
        let handle = self.submit(graph, partitions, directive)?;
        self.wait(&handle).await
    }

    pub fn info(&self, handle: &JobHandle) -> EngineResult<JobInfo> {
        Ok(self.job(handle)?.info())
    }

    /// Resultados de un job terminado; `None` si todavía corre.
    pub fn results(&self, handle: &JobHandle) -> EngineResult<Option<JobResults>> {
        let job = self.job(handle)?;
        let st = job.lock();
        if !st.info.status.is_terminal() {
            return Ok(None);
        }
        Ok(Some(JobResults {
            job_id: st.info.id.clone(),
            status: st.info.status,
            result: st.result.clone(),
            error: st.info.error.clone(),
        }))
    }

    /// Olvida los jobs terminados más viejos cuando se supera
    /// `max_retained_jobs`. Los jobs en curso nunca se descartan.
    fn forget_finished(&self) {
        let limit = self.session.config().max_retained_jobs;
        let mut jobs = self.jobs();
        if jobs.len() <= limit {
            return;
        }

        let mut finished: Vec<_> = jobs
            .iter()
            .filter_map(|(id, job)| {
                let st = job.lock();
                st.info
                    .status
                    .is_terminal()
                    .then(|| (st.info.finished_at.unwrap_or(st.info.submitted_at), id.clone()))
            })
            .collect();
        finished.sort();

        let excess = jobs.len() - limit;
        for (_, id) in finished.into_iter().take(excess) {
            debug!("olvidando job terminado {}", id);
            jobs.remove(&id);
        }
    }

    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let jobs: Vec<Arc<JobShared>> = self.jobs().values().cloned().collect();
        let mut out: Vec<JobInfo> = jobs.iter().map(|j| j.info()).collect();
        out.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        out
    }
}

/* =========================
   Ejecución de un job
   ========================= */

async fn drive(
    session: &Arc<Session>,
    job: &Arc<JobShared>,
    graph: Arc<FlowGraph>,
    partitions: Vec<Partition>,
    directive: StorageDirective,
) -> EngineResult<JobResult> {
    job.mark_running();
    let job_id = job.lock().info.id.clone();

    let mut set = JoinSet::new();
    for part in partitions {
        let task = Task::new(&job_id, part.id);
        set.spawn(run_partition(
            Arc::clone(session),
            Arc::clone(job),
            Arc::clone(&graph),
            part,
            task,
        ));
    }

    let mut finished: Vec<Finished> = Vec::new();
    while let Some(joined) = set.join_next().await {
        let res = joined.unwrap_or_else(|e| Err(EngineError::partition_failed(0, e)));
        match res {
            Ok(done) => {
                job.task_completed();
                finished.push(done);
            }
            Err(e) => {
                // el resto de las particiones ya no sirve
                job.cancel.cancel();
                set.abort_all();
                return Err(e);
            }
        }
    }

    if job.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    finished.sort_by_key(|f| f.partition);
    let name = job.lock().info.name.clone();

    match graph.aggregation() {
        Some(agg) => {
            let mut accs = Vec::with_capacity(finished.len());
            for f in finished {
                match f.output {
                    PartitionOutput::Accumulator(acc) => accs.push(acc),
                    PartitionOutput::Records(_) => {
                        return Err(EngineError::partition_failed(
                            f.partition,
                            "se esperaba un acumulador",
                        ))
                    }
                }
            }
            let total = merge_all(accs)?.unwrap_or_else(|| Accumulator::empty(agg));
            let result = total.finish();

            let persisted = match directive.tier() {
                Some(tier) => {
                    let rows = result.to_records();
                    let len = rows.len();
                    let part = Partition::new(0, Locator::Memory { offset: 0, len }, rows);
                    Some(session.store().persist(&name, &[part], tier)?)
                }
                None => None,
            };

            Ok(JobResult {
                output: JobOutput::Aggregate(result),
                persisted,
            })
        }
        None => {
            let mut parts = Vec::with_capacity(finished.len());
            let mut homes = Vec::with_capacity(finished.len());
            let mut offset = 0;
            for f in finished {
                let records = match f.output {
                    PartitionOutput::Records(recs) => recs,
                    PartitionOutput::Accumulator(_) => {
                        return Err(EngineError::partition_failed(
                            f.partition,
                            "se esperaban registros",
                        ))
                    }
                };
                let len = records.len();
                parts.push(Partition::new(
                    f.partition,
                    Locator::Memory { offset, len },
                    records,
                ));
                homes.push(Some(f.worker));
                offset += len;
            }

            let persisted = match directive.tier() {
                Some(tier) => Some(session.store().persist_placed(&name, &parts, &homes, tier)?),
                None => None,
            };

            Ok(JobResult {
                output: JobOutput::Records(common::partition::concat(&parts)),
                persisted,
            })
        }
    }
}

/// Ejecuta una partición con reintentos: prefiere el worker que la tiene
/// materializada y, tras un fallo, uno donde no se haya intentado.
async fn run_partition(
    session: Arc<Session>,
    job: Arc<JobShared>,
    graph: Arc<FlowGraph>,
    partition: Partition,
    mut task: Task,
) -> EngineResult<Finished> {
    let preferred = match &partition.locator {
        Locator::Persisted { handle, index } => session.store().home_of(handle, *index),
        _ => None,
    };
    let max_attempts = session.config().max_task_attempts;

    loop {
        if job.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let worker = session
            .pool()
            .pick(preferred.as_deref(), &task.tried)
            .ok_or(EngineError::NoWorkers)?;

        let res = worker
            .execute(
                &task,
                Arc::clone(&graph),
                partition.clone(),
                Arc::clone(session.registry()),
                job.cancel.clone(),
            )
            .await;

        match res {
            Ok(output) => {
                return Ok(Finished {
                    partition: partition.id,
                    worker: worker.id().to_string(),
                    output,
                })
            }
            Err(e) if e.is_retryable() => match task.retry(worker.id(), max_attempts) {
                Some(next) => {
                    warn!(
                        "reintentando partición {} del job {} (attempt={}): {}",
                        partition.id, task.job_id, next.attempt, e
                    );
                    job.task_retried();
                    task = next;
                }
                None => {
                    warn!(
                        "partición {} del job {} superó el máximo de intentos ({}), marcando job como FAILED",
                        partition.id, task.job_id, max_attempts
                    );
                    job.task_failed();
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

fn finalize(session: &Session, job: &JobShared, outcome: EngineResult<JobResult>) {
    let persisted = outcome.as_ref().ok().and_then(|r| r.persisted.clone());
    let id = job.lock().info.id.clone();

    match &outcome {
        Ok(_) => info!("job {} completado", id),
        Err(EngineError::Cancelled) => debug!("job {} terminó cancelado", id),
        Err(e) => warn!("job {} falló: {}", id, e),
    }

    if !job.finish(outcome) {
        // cancelado mientras se cerraba: lo persistido no se publica
        if let Some(handle) = persisted {
            let _ = session.store().release(&handle);
        }
    }
}
