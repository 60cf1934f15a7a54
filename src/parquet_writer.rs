use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, Float64Builder, Int64Builder, StringBuilder},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::{basic::Compression, file::properties::WriterProperties};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::common::{ensure_parent_dir, tmp_path_for};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Utf8,
    Float64,
    Int64,
}

impl ColumnType {
    fn data_type(self) -> DataType {
        match self {
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Int64 => DataType::Int64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell<'a> {
    Str(Option<&'a str>),
    F64(f64),
    I64(i64),
}

enum ColumnBuilder {
    Utf8(StringBuilder),
    Float64(Float64Builder),
    Int64(Int64Builder),
}

impl ColumnBuilder {
    fn new(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Utf8 => ColumnBuilder::Utf8(StringBuilder::new()),
            ColumnType::Float64 => ColumnBuilder::Float64(Float64Builder::new()),
            ColumnType::Int64 => ColumnBuilder::Int64(Int64Builder::new()),
        }
    }

    fn append(&mut self, cell: Cell<'_>) -> bool {
        match (self, cell) {
            (ColumnBuilder::Utf8(b), Cell::Str(Some(v))) => b.append_value(v),
            (ColumnBuilder::Utf8(b), Cell::Str(None)) => b.append_null(),
            (ColumnBuilder::Float64(b), Cell::F64(v)) => b.append_value(v),
            (ColumnBuilder::Int64(b), Cell::I64(v)) => b.append_value(v),
            _ => return false,
        }
        true
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
        }
    }
}

/// Batched Parquet writer with a fixed typed schema.
///
/// Rows go to `<output>.tmp`; `finish` renames it over the output path.
pub struct TypedParquetWriter {
    output_path: PathBuf,
    tmp_path: PathBuf,
    schema: Arc<Schema>,
    writer: ArrowWriter<File>,
    builders: Vec<ColumnBuilder>,
    rows_in_batch: usize,
    batch_size: usize,
}

impl TypedParquetWriter {
    pub fn try_new(
        output_path: &Path,
        columns: &[(&str, ColumnType)],
        batch_size: usize,
    ) -> Result<Self> {
        ensure_parent_dir(output_path)?;
        let tmp_path = tmp_path_for(output_path);

        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, column_type)| {
                Field::new(*name, column_type.data_type(), *column_type == ColumnType::Utf8)
            })
            .collect();
        let schema = Arc::new(Schema::new(fields));

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();

        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
        let writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props))
            .context("Failed creating Parquet ArrowWriter")?;

        let builders = columns
            .iter()
            .map(|(_, column_type)| ColumnBuilder::new(*column_type))
            .collect();

        Ok(Self {
            output_path: output_path.to_path_buf(),
            tmp_path,
            schema,
            writer,
            builders,
            rows_in_batch: 0,
            batch_size: batch_size.max(1),
        })
    }

    pub fn push_row(&mut self, values: &[Cell<'_>]) -> Result<()> {
        anyhow::ensure!(
            values.len() == self.builders.len(),
            "push_row expected {} columns, got {}",
            self.builders.len(),
            values.len()
        );

        for (idx, value) in values.iter().enumerate() {
            anyhow::ensure!(
                self.builders[idx].append(*value),
                "column {} ({}) cannot hold {:?}",
                idx,
                self.schema.field(idx).name(),
                value
            );
        }
        self.rows_in_batch += 1;
        if self.rows_in_batch >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    /// On any failure the temp file is removed and the output path is left alone.
    pub fn finish(mut self) -> Result<()> {
        if let Err(err) = self.flush_batch() {
            self.abort();
            return Err(err);
        }
        let Self {
            output_path,
            tmp_path,
            writer,
            ..
        } = self;
        let moved = writer
            .close()
            .context("Failed closing Parquet writer")
            .and_then(|_| {
                fs::rename(&tmp_path, &output_path).with_context(|| {
                    format!(
                        "Failed moving temp parquet {} to {}",
                        tmp_path.display(),
                        output_path.display()
                    )
                })
            });
        if moved.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        moved
    }

    /// Drops the partial file so a failed export never replaces a good one.
    pub fn abort(self) {
        let _ = self.writer.close();
        let _ = fs::remove_file(&self.tmp_path);
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.rows_in_batch == 0 {
            return Ok(());
        }

        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(ColumnBuilder::finish).collect();
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), arrays)
            .context("Failed creating RecordBatch for Parquet write")?;
        self.writer
            .write(&batch)
            .context("Failed writing Parquet RecordBatch")?;
        self.rows_in_batch = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float64Array, Int64Array, StringArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    #[test]
    fn writes_typed_columns_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scored.parquet");
        let columns = [
            ("provider_id", ColumnType::Utf8),
            ("fraud_probability", ColumnType::Float64),
            ("rank", ColumnType::Int64),
        ];
        let mut writer = TypedParquetWriter::try_new(&path, &columns, 2).unwrap();
        writer
            .push_row(&[Cell::Str(Some("1000000001")), Cell::F64(0.9), Cell::I64(1)])
            .unwrap();
        writer
            .push_row(&[Cell::Str(None), Cell::F64(0.25), Cell::I64(2)])
            .unwrap();
        writer
            .push_row(&[Cell::Str(Some("1000000003")), Cell::F64(0.1), Cell::I64(3)])
            .unwrap();
        writer.finish().unwrap();
        assert!(!tmp_path_for(&path).exists());

        let file = File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file).unwrap().build().unwrap();
        let mut ids = Vec::new();
        let mut probs = Vec::new();
        let mut ranks = Vec::new();
        for batch in reader {
            let batch = batch.unwrap();
            let id_col = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
            let prob_col = batch.column(1).as_any().downcast_ref::<Float64Array>().unwrap();
            let rank_col = batch.column(2).as_any().downcast_ref::<Int64Array>().unwrap();
            for i in 0..batch.num_rows() {
                ids.push((!id_col.is_null(i)).then(|| id_col.value(i).to_string()));
                probs.push(prob_col.value(i));
                ranks.push(rank_col.value(i));
            }
        }
        assert_eq!(
            ids,
            vec![Some("1000000001".to_string()), None, Some("1000000003".to_string())]
        );
        assert_eq!(probs, vec![0.9, 0.25, 0.1]);
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn mismatched_cell_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.parquet");
        let mut writer =
            TypedParquetWriter::try_new(&path, &[("rank", ColumnType::Int64)], 10).unwrap();
        assert!(writer.push_row(&[Cell::F64(1.0)]).is_err());
        assert!(writer.push_row(&[]).is_err());
        writer.abort();
        assert!(!tmp_path_for(&path).exists());
        assert!(!path.exists());
    }

    #[test]
    fn failed_flush_removes_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uneven.parquet");
        let columns = [("rank", ColumnType::Int64), ("position", ColumnType::Int64)];
        let mut writer = TypedParquetWriter::try_new(&path, &columns, 10).unwrap();
        // the first column takes the value before the second rejects its cell
        assert!(writer.push_row(&[Cell::I64(1), Cell::F64(1.0)]).is_err());
        writer.push_row(&[Cell::I64(2), Cell::I64(2)]).unwrap();

        assert!(writer.finish().is_err());
        assert!(!tmp_path_for(&path).exists());
        assert!(!path.exists());
    }

    #[test]
    fn failed_rename_removes_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.parquet");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep.txt"), "x").unwrap();
        let mut writer =
            TypedParquetWriter::try_new(&path, &[("rank", ColumnType::Int64)], 10).unwrap();
        writer.push_row(&[Cell::I64(1)]).unwrap();

        assert!(writer.finish().is_err());
        assert!(!tmp_path_for(&path).exists());
        assert!(path.join("keep.txt").exists());
    }
}
