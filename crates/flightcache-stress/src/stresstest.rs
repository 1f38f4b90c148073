use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::workloads::{PreparedWorkload, WorkloadsConfig, prepare_workload, process_operation};

struct WorkloadReport {
    concurrency: usize,
    durations: DDSketch,
    failures: usize,
    computations: usize,
    entries: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            workload
                .validate()
                .with_context(|| format!("invalid workload {i}"))?;
            Ok(Arc::new(prepare_workload(i, workload, &config.cache)))
        })
        .collect::<Result<_>>()?;

    // warmup: run one operation per workload so that the runtime is warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_operation(&workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move { run_workload(workload, deadline).await });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let report = task.context("workload task failed")?;
        print_report(i, &report, duration);
    }

    Ok(())
}

async fn run_workload(
    workload: Arc<PreparedWorkload>,
    deadline: tokio::time::Instant,
) -> WorkloadReport {
    let concurrency = workload.workload.concurrency;
    let task_durations = Arc::new(Mutex::new(DDSketch::default()));
    let failures = Arc::new(AtomicUsize::new(0));
    let semaphore = Arc::new(Semaphore::new(concurrency));

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        if deadline.elapsed() > Duration::ZERO {
            break;
        }
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                let workload = Arc::clone(&workload);
                let task_durations = Arc::clone(&task_durations);
                let failures = Arc::clone(&failures);
                let task_start = Instant::now();

                tokio::spawn(async move {
                    if !process_operation(&workload).await {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }

                    task_durations
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .add(task_start.elapsed().as_secs_f64());

                    drop(permit);
                });
            }
            _ = &mut sleep => {
                break;
            }
        }
    }

    // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
    let _permits = semaphore.acquire_many(concurrency as u32).await;

    let durations: DDSketch = {
        let mut task_durations = task_durations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut task_durations)
    };

    WorkloadReport {
        concurrency,
        durations,
        failures: failures.load(Ordering::Relaxed),
        computations: workload.computations(),
        entries: workload.cache.entry_count(),
    }
}

fn print_report(i: usize, report: &WorkloadReport, duration: Duration) {
    let WorkloadReport {
        concurrency,
        durations,
        failures,
        computations,
        entries,
    } = report;

    let ops = durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
    println!("  computations: {computations}; failures: {failures}; entries: {entries}");

    if ops == 0 {
        return;
    }

    let quantile = |q| {
        let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs)
    };
    let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
    let p50 = quantile(0.5);
    let p90 = quantile(0.9);
    let p99 = quantile(0.99);
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}
