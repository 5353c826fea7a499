//! Data-parallel execution of a transform.
//!
//! The input table is cut into partitions (group-preserving when a group
//! column is set), every partition is handed to a worker of a run-local
//! `rayon` pool, and the results are merged back into one table.
//!
//! Partitions and results travel through a hand-off channel. With
//! [`Handoff::Archive`] they are encoded IPC files in a scratch directory the
//! run owns and removes on every exit path; with [`Handoff::InMemory`] they
//! are shared immutable batches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use rayon::ThreadPool;
use tempfile::TempDir;

use super::{SchemaSpec, TableData, Transform, TransformExt};
use crate::chunks;
use crate::config::{EngineConfig, FanOutStrategy, Handoff};
use crate::error::TabularError;
use crate::registry::TypeRegistry;
use crate::schema::Schema;
use crate::store::{ArchiveStore, DataStore, StoreContext};

//==================================================================================
// I. Hand-off channel
//==================================================================================

/// A partition or result waiting between two steps of a run.
enum Parcel {
    Batch(RecordBatch),
    File(ArchiveStore),
}

impl Parcel {
    fn open(&self) -> Result<RecordBatch, TabularError> {
        match self {
            Parcel::Batch(batch) => Ok(batch.clone()),
            Parcel::File(store) => store.load_raw(),
        }
    }

    fn discard(self) -> Result<(), TabularError> {
        match self {
            Parcel::Batch(_) => Ok(()),
            Parcel::File(store) => store.delete(),
        }
    }

    fn receive(self) -> Result<RecordBatch, TabularError> {
        let batch = self.open()?;
        self.discard()?;
        Ok(batch)
    }
}

enum Channel {
    InMemory,
    Archive {
        // Dropping the directory removes whatever parcels are left in it.
        scratch: TempDir,
        context: StoreContext,
        next: AtomicUsize,
    },
}

impl Channel {
    fn open(handoff: Handoff, config: &Arc<EngineConfig>) -> Result<Self, TabularError> {
        match handoff {
            Handoff::InMemory => Ok(Channel::InMemory),
            Handoff::Archive => {
                let scratch = tempfile::Builder::new()
                    .prefix("tabulon-parallel-")
                    .tempdir_in(config.temp_dir()?)?;
                log::debug!("Parallel run hands off through {}", scratch.path().display());
                Ok(Channel::Archive {
                    scratch,
                    context: StoreContext::new(
                        Schema::anonymous_partial(),
                        TypeRegistry::standard(),
                        config.clone(),
                    ),
                    next: AtomicUsize::new(0),
                })
            }
        }
    }

    fn send(&self, batch: RecordBatch) -> Result<Parcel, TabularError> {
        match self {
            Channel::InMemory => Ok(Parcel::Batch(batch)),
            // Archives refuse empty tables; an empty batch costs nothing to keep.
            Channel::Archive { .. } if batch.num_rows() == 0 => Ok(Parcel::Batch(batch)),
            Channel::Archive {
                scratch,
                context,
                next,
            } => {
                let id = next.fetch_add(1, Ordering::Relaxed);
                let store = ArchiveStore::new(
                    context.clone(),
                    scratch.path().join(format!("parcel_{}", id)),
                )
                .encoded(true);
                store.store_raw(&batch)?;
                Ok(Parcel::File(store))
            }
        }
    }
}

//==================================================================================
// II. The transform
//==================================================================================

/// Runs `inner` over partitions of its input on a thread pool.
///
/// With a group column, no group is ever split across partitions and
/// `inner` is applied to one group at a time. The result holds the same rows
/// as applying `inner` to the whole input; their order is only fixed when the
/// output schema declares `order_by`.
pub struct ParallelTransform {
    inner: Arc<dyn Transform>,
    group_column: Option<String>,
    config: Arc<EngineConfig>,
}

enum Split {
    Leaf(Parcel),
    Branch(Vec<Parcel>),
}

impl ParallelTransform {
    pub fn new(inner: Arc<dyn Transform>, config: Arc<EngineConfig>) -> Self {
        Self {
            inner,
            group_column: None,
            config,
        }
    }

    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_column = Some(column.into());
        self
    }

    fn pool(&self, jobs: usize) -> Result<ThreadPool, TabularError> {
        let build = |n: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .thread_name(|i| format!("tabulon-worker-{}", i))
                .build()
        };
        match build(jobs) {
            Ok(pool) => Ok(pool),
            Err(e) if jobs > 1 => {
                log::warn!("Could not start {} workers ({}); running on one", jobs, e);
                build(1).map_err(|e| TabularError::Internal(e.to_string()))
            }
            Err(e) => Err(TabularError::Internal(e.to_string())),
        }
    }

    /// Cuts `table` into pieces of about `size` rows.
    fn partition(&self, table: &RecordBatch, size: usize) -> Result<Vec<RecordBatch>, TabularError> {
        let size = size.max(1);
        match &self.group_column {
            Some(column) => chunks::split_by_group(
                table,
                column,
                size,
                self.config.parallel.avg_rows_per_group_hint,
            )?
            .collect(),
            None => Ok(chunks::split(table, size)?.collect()),
        }
    }

    fn group_count(&self, table: &RecordBatch) -> Result<usize, TabularError> {
        match &self.group_column {
            Some(column) => Ok(chunks::group_rows(table, column)?.len()),
            None => Ok(0),
        }
    }

    /// Applies `inner` to one partition, group by group when grouping.
    fn apply_partition(&self, partition: &RecordBatch) -> Result<RecordBatch, TabularError> {
        let Some(column) = &self.group_column else {
            return self
                .inner
                .apply(TableData::Single(partition.clone()))?
                .into_single();
        };
        let mut results = Vec::new();
        for rows in chunks::group_rows(partition, column)? {
            let group = take_record_batch(partition, &UInt32Array::from(rows))?;
            results.push(self.inner.apply(TableData::Single(group))?.into_single()?);
        }
        merge_results(results)
    }

    /// Receives a partition, transforms it and sends the result back.
    fn job(&self, index: usize, parcel: Parcel, channel: &Channel) -> Result<Parcel, TabularError> {
        let run = || -> Result<Parcel, TabularError> {
            let partition = parcel.receive()?;
            let result = self.apply_partition(&partition)?;
            log::debug!(
                "Partition {}: {} rows in, {} rows out",
                index,
                partition.num_rows(),
                result.num_rows()
            );
            channel.send(result)
        };
        run().map_err(|e| e.in_partition(index))
    }

    fn run_jobs(
        &self,
        pool: &ThreadPool,
        channel: &Channel,
        parcels: Vec<Parcel>,
    ) -> Result<Vec<Parcel>, TabularError> {
        pool.install(|| {
            parcels
                .into_par_iter()
                .enumerate()
                .map(|(i, parcel)| self.job(i, parcel, channel))
                .collect()
        })
    }

    fn single_level(
        &self,
        table: RecordBatch,
        pool: &ThreadPool,
        channel: &Channel,
        jobs: usize,
    ) -> Result<RecordBatch, TabularError> {
        let size = match table.num_rows() / jobs {
            0 => self.config.chunk_size_rows,
            n => n,
        };
        let parcels = self
            .partition(&table, size)?
            .into_iter()
            .map(|p| channel.send(p))
            .collect::<Result<Vec<_>, _>>()?;
        drop(table);
        log_metric!(
            "event" = "parallel_fan_out",
            "strategy" = "single_level",
            "partitions" = parcels.len(),
            "jobs" = jobs
        );

        let results = self.run_jobs(pool, channel, parcels)?;
        let batches = results
            .into_iter()
            .map(Parcel::receive)
            .collect::<Result<Vec<_>, _>>()?;
        merge_results(batches)
    }

    fn recursive(
        &self,
        table: RecordBatch,
        pool: &ThreadPool,
        channel: &Channel,
        fan_out: usize,
        max_rows: usize,
        max_groups: usize,
    ) -> Result<RecordBatch, TabularError> {
        let mut pending = vec![channel.send(table)?];
        let mut leaves = Vec::new();
        let mut waves = 0;

        while !pending.is_empty() {
            waves += 1;
            let splits: Vec<Split> = pool.install(|| {
                pending
                    .into_par_iter()
                    .map(|parcel| self.split_once(parcel, channel, fan_out, max_rows, max_groups))
                    .collect::<Result<_, TabularError>>()
            })?;
            pending = Vec::new();
            for split in splits {
                match split {
                    Split::Leaf(parcel) => leaves.push(parcel),
                    Split::Branch(parts) => pending.extend(parts),
                }
            }
        }
        log_metric!(
            "event" = "parallel_fan_out",
            "strategy" = "recursive",
            "partitions" = leaves.len(),
            "split_waves" = waves
        );

        let mut results = self.run_jobs(pool, channel, leaves)?;
        while results.len() > 1 {
            let mut groups: Vec<Vec<Parcel>> = Vec::new();
            let mut iter = results.into_iter().peekable();
            while iter.peek().is_some() {
                groups.push(iter.by_ref().take(fan_out).collect());
            }
            results = pool.install(|| {
                groups
                    .into_par_iter()
                    .map(|group| {
                        let batches = group
                            .into_iter()
                            .map(Parcel::receive)
                            .collect::<Result<Vec<_>, _>>()?;
                        channel.send(merge_results(batches)?)
                    })
                    .collect::<Result<Vec<_>, TabularError>>()
            })?;
        }
        match results.pop() {
            Some(parcel) => parcel.receive(),
            None => Err(TabularError::Internal("parallel run produced no result".into())),
        }
    }

    /// Splits an oversized partition into `fan_out` pieces. A partition within
    /// both thresholds, or one that cannot be cut further, is a leaf.
    fn split_once(
        &self,
        parcel: Parcel,
        channel: &Channel,
        fan_out: usize,
        max_rows: usize,
        max_groups: usize,
    ) -> Result<Split, TabularError> {
        let table = parcel.open()?;
        let rows = table.num_rows();
        let groups = self.group_count(&table)?;
        if rows <= max_rows && groups <= max_groups {
            return Ok(Split::Leaf(parcel));
        }
        let parts = self.partition(&table, rows.div_ceil(fan_out))?;
        if parts.len() <= 1 {
            log::debug!("Partition of {} rows cannot be split further", rows);
            return Ok(Split::Leaf(parcel));
        }
        parcel.discard()?;
        let parcels = parts
            .into_iter()
            .map(|p| channel.send(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Split::Branch(parcels))
    }
}

/// Concatenates results, ignoring empty ones unless every result is empty.
fn merge_results(results: Vec<RecordBatch>) -> Result<RecordBatch, TabularError> {
    let (mut non_empty, empty): (Vec<_>, Vec<_>) =
        results.into_iter().partition(|r| r.num_rows() > 0);
    match non_empty.len() {
        0 => empty
            .into_iter()
            .next()
            .ok_or_else(|| TabularError::Internal("no results to merge".into())),
        1 => Ok(non_empty.remove(0)),
        _ => chunks::merge(&non_empty),
    }
}

impl Transform for ParallelTransform {
    fn input_schema(&self) -> SchemaSpec {
        self.inner.input_schema()
    }

    fn output_schema(&self) -> SchemaSpec {
        self.inner.output_schema()
    }

    fn load_unchecked(&self) -> Result<TableData, TabularError> {
        self.inner.load()
    }

    fn apply_unchecked(&self, data: TableData) -> Result<TableData, TabularError> {
        let table = match data {
            TableData::Single(table) => table,
            TableData::Multi(_) => {
                return Err(TabularError::Unsupported(
                    "parallel execution of multi-table transforms".into(),
                ))
            }
        };
        if table.num_rows() == 0 {
            return self.inner.apply(TableData::Single(table));
        }

        let jobs = self.config.parallel.effective_jobs();
        let pool = self.pool(jobs)?;
        let channel = Channel::open(self.config.parallel.handoff, &self.config)?;
        let rows = table.num_rows();

        let result = match self.config.parallel.strategy {
            FanOutStrategy::SingleLevel => self.single_level(table, &pool, &channel, jobs)?,
            FanOutStrategy::Recursive {
                fan_out,
                max_rows_per_job,
                max_groups_per_job,
            } => self.recursive(
                table,
                &pool,
                &channel,
                fan_out.max(2),
                max_rows_per_job,
                max_groups_per_job,
            )?,
        };
        log::info!(
            "Parallel {} on {} workers: {} rows in, {} rows out",
            self.inner.name(),
            jobs,
            rows,
            result.num_rows()
        );
        Ok(TableData::Single(result))
    }

    fn name(&self) -> String {
        format!("Parallel[{}]", self.inner.name())
    }

    fn registry(&self) -> Arc<TypeRegistry> {
        self.inner.registry()
    }
}

impl std::fmt::Debug for ParallelTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelTransform")
            .field("inner", &self.inner.name())
            .field("group_column", &self.group_column)
            .field("parallel", &self.config.parallel)
            .finish()
    }
}
