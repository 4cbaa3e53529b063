use crate::model::Record;

/// Records awaiting one sink call. The size threshold is a flush trigger
/// checked after each page is appended, so a batch can overshoot it by up
/// to one page.
#[derive(Debug)]
pub struct Batch {
    records: Vec<Record>,
    max_size: usize,
}

impl Batch {
    pub fn new(max_size: usize) -> Self {
        Self {
            records: Vec::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn extend(&mut self, records: Vec<Record>) {
        self.records.extend(records);
    }

    pub fn should_flush(&self) -> bool {
        self.records.len() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Empties the batch, handing its records to the caller.
    pub fn take(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.records)
    }
}
