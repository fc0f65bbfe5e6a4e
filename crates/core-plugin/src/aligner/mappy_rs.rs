//! Multi-threaded minimap2 aligner.
//!
//! Same index and mapping semantics as `mappy`, but mapping fans out across
//! a persistent worker pool. From the driver's viewpoint the contract is
//! unchanged: a lazy sequence in, a lazy sequence out, order unspecified.

use std::path::PathBuf;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::Deserialize;
use toml::Table;
use tracing::{debug, error};

use core_model::BasecalledRead;

use crate::{Aligner, PluginError, ReadStream, parse_options};

use super::index::{IndexOptions, ReferenceIndex, default_index_threads, map_read};

const PLUGIN: &str = "aligner.mappy_rs";

fn default_workers() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MappyRsOptions {
    pub index: PathBuf,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default = "default_index_threads")]
    pub index_threads: usize,
    /// Mapping worker threads.
    #[serde(default = "default_workers")]
    pub n_threads: usize,
}

impl MappyRsOptions {
    fn index_options(&self) -> IndexOptions {
        IndexOptions {
            index: self.index.clone(),
            preset: self.preset.clone(),
            index_threads: self.index_threads,
        }
    }
}

struct Job {
    read: BasecalledRead,
    done: Sender<BasecalledRead>,
}

struct WorkerPool {
    work_tx: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn(index: &ReferenceIndex, workers: usize) -> Result<Self, PluginError> {
        let (work_tx, work_rx) = bounded::<Job>(workers * 4);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let work_rx: Receiver<Job> = work_rx.clone();
            let aligner = index.share();
            let handle = std::thread::Builder::new()
                .name(format!("mappy-rs-{worker}"))
                .spawn(move || {
                    for mut job in work_rx.iter() {
                        if !job.read.sequence.is_empty() {
                            job.read.alignments = map_read(&aligner, &job.read);
                        }
                        // The batch consumer may have hung up mid-stream;
                        // keep draining so later batches see idle workers.
                        let _ = job.done.send(job.read);
                    }
                })
                .map_err(|err| PluginError::InitFailed {
                    plugin: PLUGIN,
                    reason: format!("failed to spawn mapping worker: {err}"),
                })?;
            handles.push(handle);
        }
        Ok(Self { work_tx, handles })
    }

    fn shutdown(self) {
        drop(self.work_tx);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

pub struct MappyRsAligner {
    options: MappyRsOptions,
    index: Option<ReferenceIndex>,
    pool: Option<WorkerPool>,
}

impl MappyRsAligner {
    pub fn from_options(options: &Table) -> Result<Self, PluginError> {
        let options: MappyRsOptions = parse_options(PLUGIN, options)?;
        Ok(Self {
            options,
            index: None,
            pool: None,
        })
    }
}

impl Aligner for MappyRsAligner {
    fn align(&self, reads: ReadStream) -> ReadStream {
        let Some(pool) = self.pool.as_ref() else {
            error!(
                target: "plugin.mapper",
                "aligner not initialised, reads pass through unmapped"
            );
            return reads;
        };
        let (done_tx, done_rx) = bounded::<BasecalledRead>(64);
        let work_tx = pool.work_tx.clone();
        // Feeder: pulls the upstream lazy sequence onto the pool. The batch
        // ends when every job's `done` clone (and this one) is gone.
        std::thread::spawn(move || {
            for read in reads {
                let job = Job {
                    read,
                    done: done_tx.clone(),
                };
                if work_tx.send(job).is_err() {
                    break;
                }
            }
        });
        Box::new(done_rx.into_iter())
    }

    fn validate(&mut self) -> Result<(), PluginError> {
        if self.index.is_none() {
            self.index = Some(ReferenceIndex::load(PLUGIN, &self.options.index_options())?);
        }
        if self.pool.is_none()
            && let Some(index) = self.index.as_ref()
        {
            let workers = self.options.n_threads.max(1);
            self.pool = Some(WorkerPool::spawn(index, workers)?);
            debug!(target: "plugin.mapper", workers, "worker_pool_started");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "minimap2 aligner over {} ({} mapping threads{})",
            self.options.index.display(),
            self.options.n_threads.max(1),
            if self.initialised() { ", loaded" } else { "" }
        )
    }

    fn initialised(&self) -> bool {
        self.pool.is_some()
    }

    fn contigs(&self) -> Option<Vec<String>> {
        self.index.as_ref().map(ReferenceIndex::contig_names)
    }

    fn disconnect(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
            debug!(target: "plugin.mapper", "worker_pool_stopped");
        }
        self.index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_worker_count() {
        let mut table = Table::new();
        table.insert(
            "index".to_string(),
            toml::Value::String("/refs/hg38.mmi".to_string()),
        );
        let aligner = MappyRsAligner::from_options(&table).unwrap();
        assert_eq!(aligner.options.n_threads, 4);
        assert!(!aligner.initialised());
    }

    #[test]
    fn validate_requires_existing_reference() {
        let mut table = Table::new();
        table.insert(
            "index".to_string(),
            toml::Value::String("/nonexistent/hg38.mmi".to_string()),
        );
        table.insert("n_threads".to_string(), toml::Value::Integer(2));
        let mut aligner = MappyRsAligner::from_options(&table).unwrap();
        assert!(aligner.validate().is_err());
    }
}
