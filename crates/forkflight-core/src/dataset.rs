//! In-memory datasets
//!
//! The registry is built once at server startup and never mutated. It is
//! shared by reference count across request handlers; each request walks
//! it independently in registration order.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::error::{CoreError, Result};

/// Name of the dataset the reproduction server registers
pub const SAMPLE_DATASET_NAME: &str = "fork_test_tbl";

/// A named, read-only collection of record batches
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Dataset {
    /// Create a dataset, checking every batch against `schema`
    pub fn try_new(
        name: impl Into<String>,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<Self> {
        let name = name.into();
        for (i, batch) in batches.iter().enumerate() {
            if batch.schema().fields() != schema.fields() {
                return Err(CoreError::SchemaMismatch {
                    dataset: name,
                    message: format!("batch {} does not match the dataset schema", i),
                });
            }
        }

        Ok(Self {
            name,
            schema,
            batches,
        })
    }

    /// Create a dataset from a single batch
    pub fn from_batch(name: impl Into<String>, batch: RecordBatch) -> Self {
        Self {
            name: name.into(),
            schema: batch.schema(),
            batches: vec![batch],
        }
    }

    /// The `x`, `y`, `z` table of five rows served by the reproduction server
    pub fn sample() -> Result<Self> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Int64, false),
            Field::new("y", DataType::Int64, false),
            Field::new("z", DataType::Int64, false),
        ]));

        let column: ArrayRef = Arc::new(Int64Array::from_iter_values(0..5));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![column.clone(), column.clone(), column],
        )?;

        Self::try_new(SAMPLE_DATASET_NAME, schema, vec![batch])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

/// Immutable, ordered set of datasets
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    datasets: Arc<[Dataset]>,
}

impl DatasetRegistry {
    /// Build a registry; names must be unique, order is kept
    pub fn new(datasets: Vec<Dataset>) -> Result<Self> {
        for (i, dataset) in datasets.iter().enumerate() {
            if datasets[..i].iter().any(|d| d.name == dataset.name) {
                return Err(CoreError::DuplicateDataset(dataset.name.clone()));
            }
        }

        Ok(Self {
            datasets: datasets.into(),
        })
    }

    pub fn empty() -> Self {
        Self {
            datasets: Vec::new().into(),
        }
    }

    /// Registry holding only the sample dataset
    pub fn sample() -> Result<Self> {
        Self::new(vec![Dataset::sample()?])
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn get_index(&self, index: usize) -> Option<&Dataset> {
        self.datasets.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.iter().map(|d| d.name.clone()).collect()
    }
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
