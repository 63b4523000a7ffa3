
use bio::io::fastq;
use std::collections::HashMap;
use std::io;

use crate::assembler::{AssemblyResult, Consensus};

/// record id shared by every consensus, the UMI and MIG size go into the description
pub const CONSENSUS_RECORD_ID: &str = "MIG";

/// This is a wrapper for the bio::io::fastq::Writer that forces consensus reads to be written in MIG order.
/// Results that are not ready to be written are stored until every MIG before them is written or skipped.
/// # Examples
/// ```rust
/// use std::collections::BTreeMap;
/// use std::fs;
/// use tempfile::{Builder, NamedTempFile};
/// use migcall::assembler::{AssemblyResult, Consensus};
/// use migcall::ordered_fastq_writer::OrderedFastqWriter;
///
/// // File setup
/// let file: NamedTempFile = Builder::new().prefix("out_fastq_").suffix(".fq").tempfile().unwrap();
/// let temp_filename: String = file.path().to_str().unwrap().to_string();
/// {
///     let mut fastq_writer = OrderedFastqWriter::new(&file);
///
///     //MIG 0 failed to assemble and MIG 1 finished first
///     let result_b = AssemblyResult {
///         mig_index: 1,
///         consensus: Some(Consensus {
///             mig_index: 1,
///             umi: "ACGT".to_string(),
///             seq: vec![0, 1, 2, 3],
///             qual: vec![40, 40, 30, 40],
///             minors: BTreeMap::new(),
///             assembled_size: 5,
///             mig_size: 6
///         })
///     };
///     fastq_writer.write_result(result_b).unwrap();
///     fastq_writer.write_result(AssemblyResult { mig_index: 0, consensus: None }).unwrap();
///     //call flush manually if the file writer stays in scope
///     //fastq_writer.flush().unwrap();
/// }
/// //check that only the assembled MIG was written
/// let file_string = fs::read_to_string(temp_filename).unwrap();
/// let expected = "@MIG UMI:ACGT:6\nACGT\n+\nII?I\n";
/// assert_eq!(expected, file_string);
/// ```
pub struct OrderedFastqWriter<W: io::Write> {
    /// the actual fastq writer
    writer: fastq::Writer<W>,
    /// contains results we aren't ready to write yet, `None` marks a MIG that produced nothing
    map_store: HashMap<u64, Option<Consensus>>,
    /// the index for the next MIG to write
    current_index: u64,
    /// the number of records written
    records_written: u64
}

impl <W: io::Write> OrderedFastqWriter<W> {
    /// Creates an `OrderedFastqWriter` that is wrapping a file buffer.
    /// # Arguments
    /// `writer` - a buffer implementing `std::io::Write`
    pub fn new(writer: W) -> Self {
        OrderedFastqWriter {
            writer: fastq::Writer::new(writer),
            map_store: HashMap::<u64, Option<Consensus>>::new(),
            current_index: 0,
            records_written: 0
        }
    }

    /// Writes an assembly result to the file or buffers it if not ready to write.
    /// # Arguments
    /// `result` - the outcome of assembling one MIG, a missing consensus only advances the index
    pub fn write_result(&mut self, result: AssemblyResult) -> io::Result<()> {
        self.store(result.mig_index, result.consensus)
    }

    /// Marks a MIG index as finished without a consensus.
    pub fn skip(&mut self, mig_index: u64) -> io::Result<()> {
        self.store(mig_index, None)
    }

    fn store(&mut self, mig_index: u64, consensus: Option<Consensus>) -> io::Result<()> {
        if mig_index < self.current_index {
            return Err(io::Error::new(io::ErrorKind::Other, "MIG index is smaller than next expected index"));
        }
        if self.map_store.insert(mig_index, consensus).is_some() {
            return Err(io::Error::new(io::ErrorKind::Other, "MIG index was already present in the map_store"));
        }
        self.drain_map_store()
    }

    fn drain_map_store(&mut self) -> io::Result<()> {
        while let Some(entry) = self.map_store.remove(&self.current_index) {
            if let Some(consensus) = entry {
                self.writer.write(
                    CONSENSUS_RECORD_ID,
                    Some(consensus.fastq_description().as_str()),
                    consensus.seq_string().as_bytes(),
                    &consensus.qual_ascii()
                )?;
                self.records_written += 1;
            }
            self.current_index += 1;
        }
        Ok(())
    }

    /// The number of consensus records written so far.
    #[inline]
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// The number of results still waiting on an earlier MIG.
    #[inline]
    pub fn pending(&self) -> usize {
        self.map_store.len()
    }

    /// Flushes the buffer, call before trying to read anything.
    pub fn flush(&mut self) -> io::Result<()> {
        self.drain_map_store()?;
        self.writer.flush()
    }
}
