/// Local alignment and mismatch helpers
pub mod align;
/// Molecular identifier group assembly into consensus reads
pub mod assembler;
/// Minor mutation error model
pub mod error_model;
/// Parameter validation errors
pub mod errors;
/// PCR minor significance testing and FDR estimation
pub mod minor_caller;
/// Compact mutation encoding
pub mod mutation;
/// Per-reference tallies of placed consensus reads
pub mod mutations_table;
/// Writes consensus reads in MIG order
pub mod ordered_fastq_writer;
/// Position weight matrix used for consensus building
pub mod pwm;
/// Reads and MIGs
pub mod read;
/// Quality score helpers
pub mod stats_util;
/// Nucleotide encoding helpers
pub mod string_util;
/// Variant scoring, filtering, and output
pub mod variant;
