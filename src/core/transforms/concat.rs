//! Concatenates two streams.
//!
//! When both inputs report the same ordering the rows are merged in that
//! order. Otherwise each input is drained by its own task into a bounded
//! channel and rows are taken from whichever side has one ready.

use crate::core::transform::{check_cancel, Transform, TransformStats};
use crate::domain::model::Row;
use crate::domain::query::{compare_rows, sort_ordinals, SelectQuery, Sort, SortDirection};
use crate::domain::schema::Schema;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use std::cmp::Ordering;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 128;

struct Feed {
    rx: mpsc::Receiver<Result<Row>>,
    handle: JoinHandle<Box<dyn Transform>>,
    done: bool,
}

fn spawn_feed(mut input: Box<dyn Transform>, cancel: CancellationToken) -> Feed {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        loop {
            match input.read_record(&cancel).await {
                Ok(Some(row)) => {
                    if tx.send(Ok(row)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
        input
    });
    Feed { rx, handle, done: false }
}

pub struct ConcatTransform {
    inputs: [Option<Box<dyn Transform>>; 2],
    feeds: Option<[Feed; 2]>,
    /// Output ordinal to input ordinal, per input.
    mappings: [Vec<Option<usize>>; 2],
    schema: Schema,
    sorts: Vec<Sort>,
    sort_ordinals: Vec<(usize, SortDirection)>,
    peeked: [Option<Row>; 2],
    done: [bool; 2],
}

impl ConcatTransform {
    pub fn new(first: Box<dyn Transform>, second: Box<dyn Transform>) -> Self {
        Self {
            inputs: [Some(first), Some(second)],
            feeds: None,
            mappings: [Vec::new(), Vec::new()],
            schema: Schema::default(),
            sorts: Vec::new(),
            sort_ordinals: Vec::new(),
            peeked: [None, None],
            done: [false, false],
        }
    }

    pub fn is_sorted_merge(&self) -> bool {
        !self.sorts.is_empty()
    }

    fn input(&mut self, side: usize) -> Result<&mut Box<dyn Transform>> {
        self.inputs[side].as_mut().ok_or_else(|| EtlError::ProcessingError {
            message: "Concatenate input is still being read by its task".to_string(),
        })
    }

    fn map_row(&self, side: usize, row: Row) -> Result<Row> {
        self.schema
            .columns
            .iter()
            .zip(&self.mappings[side])
            .map(|(column, mapped)| match mapped {
                Some(o) => column.data_type.convert(&column.name, &row[*o]),
                None => Ok(column.default_or_null()),
            })
            .collect()
    }

    async fn read_sorted(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        for side in 0..2 {
            if self.peeked[side].is_none() && !self.done[side] {
                match self.input(side)?.read_record(cancel).await? {
                    Some(row) => self.peeked[side] = Some(self.map_row(side, row)?),
                    None => self.done[side] = true,
                }
            }
        }
        let side = match (&self.peeked[0], &self.peeked[1]) {
            (None, None) => return Ok(None),
            (Some(_), None) => 0,
            (None, Some(_)) => 1,
            (Some(a), Some(b)) => match compare_rows(&self.schema, &self.sort_ordinals, a, b)? {
                Ordering::Greater => 1,
                _ => 0,
            },
        };
        Ok(self.peeked[side].take())
    }

    async fn read_parallel(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        if self.feeds.is_none() {
            if self.done == [true, true] {
                return Ok(None);
            }
            let (Some(first), Some(second)) = (self.inputs[0].take(), self.inputs[1].take()) else {
                return Err(EtlError::ProcessingError {
                    message: "Concatenate inputs are missing".to_string(),
                });
            };
            self.feeds = Some([spawn_feed(first, cancel.clone()), spawn_feed(second, cancel.clone())]);
        }

        loop {
            let Some([first, second]) = self.feeds.as_mut() else {
                return Ok(None);
            };
            if first.done && second.done {
                self.collect_feeds().await?;
                return Ok(None);
            }
            let (side, received) = tokio::select! {
                received = first.rx.recv(), if !first.done => (0, received),
                received = second.rx.recv(), if !second.done => (1, received),
                _ = cancel.cancelled() => {
                    return Err(EtlError::Cancelled { transform: "concat".to_string() });
                }
            };
            match received {
                Some(Ok(row)) => return self.map_row(side, row).map(Some),
                Some(Err(e)) => return Err(e),
                None => {
                    if let Some(feeds) = self.feeds.as_mut() {
                        feeds[side].done = true;
                    }
                }
            }
        }
    }

    /// Takes the inputs back from their finished tasks.
    async fn collect_feeds(&mut self) -> Result<()> {
        let Some(feeds) = self.feeds.take() else {
            return Ok(());
        };
        for (side, feed) in feeds.into_iter().enumerate() {
            let input = feed.handle.await.map_err(|e| EtlError::ProcessingError {
                message: format!("Concatenate input task failed: {}", e),
            })?;
            self.inputs[side] = Some(input);
        }
        self.done = [true, true];
        Ok(())
    }
}

#[async_trait]
impl Transform for ConcatTransform {
    fn name(&self) -> &str {
        "concat"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.sorts.clone()
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        if self.feeds.is_some() {
            self.collect_feeds().await?;
        }
        let sorted_query = SelectQuery::sorted(query.sorts.clone());
        for side in 0..2 {
            self.input(side)?.open(audit_key, &sorted_query, cancel).await?;
        }

        let (first, second) = match &self.inputs {
            [Some(first), Some(second)] => (first, second),
            _ => {
                return Err(EtlError::ProcessingError {
                    message: "Concatenate inputs are missing".to_string(),
                })
            }
        };
        let mut schema = first.schema().clone();
        for column in &second.schema().columns {
            if schema.ordinal(&column.name).is_none() {
                schema.push(column.clone());
            }
        }
        self.mappings = [
            schema.columns.iter().map(|c| first.schema().ordinal(&c.name)).collect(),
            schema.columns.iter().map(|c| second.schema().ordinal(&c.name)).collect(),
        ];

        let first_sorts = first.sort_fields();
        self.sorts = if !first_sorts.is_empty() && first_sorts == second.sort_fields() {
            first_sorts
        } else {
            Vec::new()
        };
        self.sort_ordinals = sort_ordinals(&schema, &self.sorts)?;
        tracing::debug!(
            "Concatenate of '{}' and '{}' opened as {}",
            first.name(),
            second.name(),
            if self.sorts.is_empty() { "parallel read" } else { "sorted merge" }
        );
        self.schema = schema;
        self.peeked = [None, None];
        self.done = [false, false];
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        check_cancel(cancel, "concat")?;
        if self.is_sorted_merge() {
            self.read_sorted(cancel).await
        } else {
            self.read_parallel(cancel).await
        }
    }

    fn stats(&self) -> TransformStats {
        TransformStats::default()
    }

    fn primary(&self) -> Option<&dyn Transform> {
        self.inputs[0].as_deref()
    }

    /// Both inputs count as primary reads. Inputs held by running tasks are
    /// counted once they finish.
    fn total_stats(&self) -> TransformStats {
        let mut total = self.stats();
        for input in self.inputs.iter().flatten() {
            total += input.total_stats();
        }
        total
    }

    fn reset(&mut self) -> Result<()> {
        if self.feeds.is_some() {
            return Err(EtlError::ProcessingError {
                message: "Concatenate cannot reset while its inputs are being read".to_string(),
            });
        }
        self.peeked = [None, None];
        self.done = [false, false];
        for side in 0..2 {
            self.input(side)?.reset()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transforms::memory::MemoryTransform;
    use crate::domain::model::{DataType, Value};
    use crate::domain::schema::Column;

    fn numbers(name: &str, ids: &[i64]) -> MemoryTransform {
        let schema = Schema::new(name, vec![Column::new("id", DataType::Int)]);
        MemoryTransform::new(schema, ids.iter().map(|&i| vec![Value::Int(i)]).collect())
    }

    async fn drain(t: &mut ConcatTransform) -> Vec<Row> {
        let cancel = CancellationToken::new();
        let mut rows = Vec::new();
        while let Some(row) = t.read_record(&cancel).await.unwrap() {
            rows.push(row);
        }
        rows
    }

    #[tokio::test]
    async fn test_sorted_inputs_are_merged_in_order() {
        let cancel = CancellationToken::new();
        let mut t = ConcatTransform::new(Box::new(numbers("a", &[5, 1, 3])), Box::new(numbers("b", &[4, 2])));
        t.open(1, &SelectQuery::sorted(vec![Sort::asc("id")]), &cancel).await.unwrap();
        assert!(t.is_sorted_merge());
        let ids: Vec<Value> = drain(&mut t).await.into_iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, (1..=5).map(Value::from).collect::<Vec<Value>>());
        assert_eq!(t.sort_fields(), vec![Sort::asc("id")]);
    }

    #[tokio::test]
    async fn test_unsorted_inputs_are_read_in_parallel() {
        let cancel = CancellationToken::new();
        let notes = Schema::new(
            "notes",
            vec![Column::new("id", DataType::Int), Column::new("note", DataType::String)],
        );
        let second = MemoryTransform::new(notes, vec![vec![10.into(), "x".into()], vec![20.into(), "y".into()]]);
        let mut t = ConcatTransform::new(
            Box::new(numbers("a", &[1, 2, 3]).as_flat_file()),
            Box::new(second.as_flat_file()),
        );
        t.open(1, &SelectQuery::default(), &cancel).await.unwrap();
        assert!(!t.is_sorted_merge());
        assert_eq!(t.schema().column_names(), vec!["id", "note"]);

        let mut rows = drain(&mut t).await;
        rows.sort();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0], vec![Value::Int(1), Value::Null]);
        assert_eq!(rows[4], vec![Value::Int(20), Value::from("y")]);
        assert_eq!(t.total_stats().rows_read_primary, 5);
    }

    #[tokio::test]
    async fn test_reset_waits_for_tasks_to_finish() {
        let cancel = CancellationToken::new();
        let mut t = ConcatTransform::new(
            Box::new(numbers("a", &[1, 2]).as_flat_file()),
            Box::new(numbers("b", &[3]).as_flat_file()),
        );
        t.open(1, &SelectQuery::default(), &cancel).await.unwrap();
        assert!(t.read_record(&cancel).await.unwrap().is_some());
        assert!(t.reset().is_err());

        while t.read_record(&cancel).await.unwrap().is_some() {}
        t.reset().unwrap();
        let mut again = drain(&mut t).await;
        again.sort();
        assert_eq!(again, vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]]);
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let cancel = CancellationToken::new();
        let mut t = ConcatTransform::new(Box::new(numbers("a", &[1])), Box::new(numbers("b", &[2])));
        t.open(1, &SelectQuery::default(), &cancel).await.unwrap();
        cancel.cancel();
        assert!(t.read_record(&cancel).await.unwrap_err().is_cancelled());
    }
}
