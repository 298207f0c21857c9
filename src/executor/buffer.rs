//! Join buffers
//!
//! A buffered node collects the partial rows of the tables before it
//! instead of reading its own table once per partial row. When the buffer
//! fills up, or the join runs out of rows, every record is matched against
//! one pass over the node's table (flat and hashed buffers) or against one
//! lookup per distinct key (key-batched buffers).

use crate::planner::table_set::TableId;
use crate::storage::RowId;

use super::row::Row;

/// Partial row saved in a join buffer
#[derive(Debug, Clone)]
pub struct BufferedRecord {
    /// Current row of every table before the buffered node
    pub slots: Vec<(TableId, Option<Row>)>,
    /// Row ids of the nodes before the buffered node
    pub rowids: Vec<Option<RowId>>,
    /// An inner row matched this record's outer-join condition
    pub matched: bool,
    /// No further inner row may extend this record
    pub done: bool,
    /// The outer-join precondition holds for this record
    pub admitted: bool,
}

impl BufferedRecord {
    pub fn new(slots: Vec<(TableId, Option<Row>)>, rowids: Vec<Option<RowId>>) -> Self {
        Self {
            slots,
            rowids,
            matched: false,
            done: false,
            admitted: true,
        }
    }

    /// Approximate bytes held by the record
    pub fn size(&self) -> usize {
        let rows: usize = self
            .slots
            .iter()
            .map(|(_, row)| row.as_ref().map_or(1, Row::width))
            .sum();
        rows + self.rowids.len() * std::mem::size_of::<RowId>()
    }

    /// Whether another inner row may still extend this record
    pub fn is_open(&self) -> bool {
        self.admitted && !self.done
    }
}

/// Records waiting for one buffered node
#[derive(Debug, Default)]
pub struct JoinBuffer {
    records: Vec<BufferedRecord>,
    bytes: usize,
}

impl JoinBuffer {
    /// Append a record; returns true once the buffer holds `capacity` bytes
    pub fn push(&mut self, record: BufferedRecord, capacity: usize) -> bool {
        self.bytes += record.size();
        self.records.push(record);
        self.bytes >= capacity
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Take every record, leaving the buffer empty
    pub fn take(&mut self) -> Vec<BufferedRecord> {
        self.bytes = 0;
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Datum;

    fn record(width: usize) -> BufferedRecord {
        BufferedRecord::new(
            vec![(0, Some(Row::new(vec![Datum::Int(1); width])))],
            vec![Some(7)],
        )
    }

    #[test]
    fn test_buffer_reports_full_at_capacity() {
        let mut buffer = JoinBuffer::default();
        let size = record(4).size();
        assert!(!buffer.push(record(4), size * 2));
        assert!(buffer.push(record(4), size * 2));
        assert_eq!(buffer.len(), 2);

        let records = buffer.take();
        assert_eq!(records.len(), 2);
        assert!(buffer.is_empty());
        assert!(!buffer.push(record(4), size * 2));
    }

    #[test]
    fn test_record_state() {
        let mut r = record(1);
        assert!(r.is_open());
        r.admitted = false;
        assert!(!r.is_open());
    }
}
