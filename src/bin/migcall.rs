
extern crate clap;
extern crate env_logger;
extern crate exitcode;
extern crate log;
extern crate needletail;

use bio::io::fasta;
use clap::{Arg, App, value_t};
use log::{debug, info, warn, error};
use needletail::parse_fastx_file;
use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, mpsc};
use threadpool::ThreadPool;

use migcall::align::LocalAligner;
use migcall::assembler::{Assembler, AssemblerParameters, AssemblerStats, AssemblyResult, Consensus, assembly_job};
use migcall::error_model::MinorMatrix;
use migcall::minor_caller::MinorCaller;
use migcall::mutation::MAX_POSITION;
use migcall::mutations_table::{MutationsTable, Reference};
use migcall::ordered_fastq_writer::OrderedFastqWriter;
use migcall::read::{Mig, Read};
use migcall::stats_util;
use migcall::variant::{ErrorModelType, Variant, VariantCaller, VariantCallerParameters, sort_variants};

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

//non-cli parameters
const JOB_SLOTS: u64 = 10000;
const UPDATE_INTERVAL: u64 = 10000;
//a consensus must align ungapped over this fraction of its length to be placed on a reference
const MIN_PLACED_FRACTION: f64 = 0.8;

/// Pulls the UMI out of a read header carrying a `UMI:<seq>[:<qual>]` token.
fn extract_umi(header: &[u8]) -> Option<String> {
    let header = String::from_utf8_lossy(header);
    for token in header.split_whitespace() {
        if let Some(rest) = token.strip_prefix("UMI:") {
            let umi: &str = rest.split(':').next().unwrap_or("");
            if !umi.is_empty() {
                return Some(umi.to_string());
            }
        }
    }
    None
}

/// Loads a FASTX file and groups its reads by UMI, in order of first appearance.
fn load_migs(filename: &str) -> Vec<Mig> {
    let mut umi_order: Vec<String> = vec![];
    let mut umi_reads: HashMap<String, Vec<Read>> = HashMap::new();
    let mut reads_loaded: u64 = 0;
    let mut reads_skipped: u64 = 0;

    match parse_fastx_file(filename) {
        Ok(mut fastx_reader) => {
            while let Some(raw_record) = fastx_reader.next() {
                let record = match raw_record {
                    Ok(record) => { record },
                    Err(e) => {
                        error!("Invalid record while parsing reads file: {:?}", e);
                        std::process::exit(exitcode::IOERR);
                    }
                };
                let umi: String = match extract_umi(record.id()) {
                    Some(umi) => umi,
                    None => {
                        reads_skipped += 1;
                        continue;
                    }
                };
                let seq = record.seq();
                let read: Read = match record.qual() {
                    Some(qual) => Read::from_ascii(&seq, qual),
                    None => Read::with_uniform_quality(migcall::string_util::convert_btoi(&seq), stats_util::MAX_QUAL)
                };
                if !umi_reads.contains_key(&umi) {
                    umi_order.push(umi.clone());
                }
                umi_reads.entry(umi).or_insert_with(Vec::new).push(read);
                reads_loaded += 1;
            }
        },
        Err(e) => {
            error!("Failed to open reads file: {:?}", e);
            std::process::exit(exitcode::IOERR);
        }
    };

    if reads_skipped > 0 {
        warn!("Skipped {} reads without a UMI:<seq> header token", reads_skipped);
    }
    info!("Loaded {} reads in {} MIGs from \"{}\"", reads_loaded, umi_order.len(), filename);

    umi_order.into_iter()
        .enumerate()
        .map(|(i, umi)| {
            let reads: Vec<Read> = umi_reads.remove(&umi).unwrap_or_default();
            Mig::new(i as u64, umi, reads)
        })
        .collect()
}

/// Handles a finished job, returns the consensus if one was made.
fn receive_result<W: Write>(rx_value: AssemblyResult, fastq_writer: &mut OrderedFastqWriter<W>, verbose_mode: bool) -> Option<Consensus> {
    if verbose_mode {
        match &rx_value.consensus {
            Some(c) => info!("MIG #{:?} {}: {} bp from {}/{} reads, {} minors", rx_value.mig_index, c.umi, c.len(), c.assembled_size, c.mig_size, c.minors.len()),
            None => info!("MIG #{:?}: not assembled", rx_value.mig_index)
        };
    }
    let consensus: Option<Consensus> = rx_value.consensus.clone();
    let write_status = match consensus {
        Some(_) => fastq_writer.write_result(rx_value),
        None => fastq_writer.skip(rx_value.mig_index)
    };
    match write_status {
        Ok(()) => {},
        Err(e) => {
            error!("Failed while writing consensus: {:?}", e);
            std::process::exit(exitcode::IOERR);
        }
    };
    consensus
}

/// Assembles every MIG on the thread pool, writing consensus reads in order.
/// Returns the consensus reads if `keep` is set.
fn assemble_migs(
    migs: Vec<Mig>, consensus_fn: &str, arc_assembler: Arc<Assembler>, arc_minor_caller: Arc<MinorCaller>,
    threads: usize, verbose_mode: bool, keep: bool
) -> Vec<Consensus> {
    let write_file: File = match File::create(consensus_fn) {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to create output consensus file: {:?}", e);
            std::process::exit(exitcode::CANTCREAT);
        }
    };
    let mut fastq_writer = OrderedFastqWriter::new(&write_file);
    let mut kept: Vec<Consensus> = vec![];

    //we need to set up the multiprocessing components now
    let pool = ThreadPool::new(threads);
    let (tx, rx) = mpsc::channel();
    let mut jobs_queued: u64 = 0;
    let mut results_received: u64 = 0;

    for mig in migs.into_iter() {
        //if we've filled our queue, then we should wait until we get some results back
        if jobs_queued - results_received >= JOB_SLOTS {
            let rx_value: AssemblyResult = rx.recv().unwrap();
            if let Some(c) = receive_result(rx_value, &mut fastq_writer, verbose_mode) {
                if keep {
                    kept.push(c);
                }
            }
            results_received += 1;
            if results_received % UPDATE_INTERVAL == 0 {
                info!("Processed {} MIGs, {} waiting to be written...", results_received, fastq_writer.pending());
            }
        }

        //clone the transmit channel and submit the pool job
        let tx = tx.clone();
        let arc_assembler = arc_assembler.clone();
        let arc_minor_caller = arc_minor_caller.clone();
        pool.execute(move|| {
            let result: AssemblyResult = assembly_job(arc_assembler, mig, arc_minor_caller);
            tx.send(result).expect("channel will be there waiting for the pool");
        });
        jobs_queued += 1;
    }

    while results_received < jobs_queued {
        let rx_value: AssemblyResult = rx.recv().unwrap();
        if let Some(c) = receive_result(rx_value, &mut fastq_writer, verbose_mode) {
            if keep {
                kept.push(c);
            }
        }
        results_received += 1;
        if results_received % UPDATE_INTERVAL == 0 {
            info!("Processed {} MIGs, {} waiting to be written...", results_received, fastq_writer.pending());
        }
    }

    match fastq_writer.flush() {
        Ok(()) => {},
        Err(e) => {
            error!("Failed while flushing consensus file: {:?}", e);
            std::process::exit(exitcode::IOERR);
        }
    };
    info!("Finished assembling {} MIGs into \"{}\"", results_received, consensus_fn);
    kept
}

/// Places a consensus on its best ungapped reference hit, trying both strands.
/// Returns true if it was placed.
fn place_consensus(aligner: &LocalAligner, tables: &mut [MutationsTable], consensus: &Consensus) -> bool {
    let rc_consensus: Consensus = consensus.reverse_complement();
    let mut best: Option<(i32, usize, isize, bool)> = None;
    for (table_index, table) in tables.iter().enumerate() {
        for &reverse in [false, true].iter() {
            let query: &Consensus = if reverse { &rc_consensus } else { consensus };
            let aln = match aligner.align(&table.reference().sequence, &query.seq) {
                Some(aln) => aln,
                None => continue
            };
            if !aln.is_ungapped() || (aln.query_range.len() as f64) < MIN_PLACED_FRACTION * query.len() as f64 {
                continue;
            }
            if best.map_or(true, |(score, _, _, _)| aln.score > score) {
                let offset: isize = aln.reference_range.start as isize - aln.query_range.start as isize;
                best = Some((aln.score, table_index, offset, reverse));
            }
        }
    }

    match best {
        Some((_, table_index, offset, reverse)) => {
            let placed: &Consensus = if reverse { &rc_consensus } else { consensus };
            tables[table_index].append(offset, placed);
            true
        },
        None => false
    }
}

fn load_references(reference_fn: &str) -> Vec<MutationsTable> {
    let reader = match fasta::Reader::from_file(reference_fn) {
        Ok(reader) => reader,
        Err(e) => {
            error!("Failed to open reference file: {:?}", e);
            std::process::exit(exitcode::NOINPUT);
        }
    };
    let mut tables: Vec<MutationsTable> = vec![];
    for raw_record in reader.records() {
        let record = match raw_record {
            Ok(record) => record,
            Err(e) => {
                error!("Invalid record while parsing reference file: {:?}", e);
                std::process::exit(exitcode::DATAERR);
            }
        };
        if record.seq().len() > MAX_POSITION + 1 {
            error!("Reference \"{}\" is longer than the supported {} bases", record.id(), MAX_POSITION + 1);
            std::process::exit(exitcode::DATAERR);
        }
        tables.push(MutationsTable::new(Reference::new(record.id(), record.seq())));
    }
    info!("Loaded {} references from \"{}\"", tables.len(), reference_fn);
    tables
}

fn stats_json(stats: &AssemblerStats) -> serde_json::Value {
    json!({
        "migs_total": stats.migs_total(),
        "migs_assembled": stats.migs_assembled(),
        "reads_total": stats.reads_total(),
        "reads_assembled": stats.reads_assembled(),
        "reads_dropped_short": stats.reads_dropped_short(),
        "reads_dropped_error": stats.reads_dropped_error(),
        "reads_rescued": stats.reads_rescued(),
        "reads_removed": stats.reads_removed()
    })
}

fn create_output(filename: &str, label: &str) -> BufWriter<File> {
    match File::create(filename) {
        Ok(file) => BufWriter::new(file),
        Err(e) => {
            error!("Failed to create {} file: {:?}", label, e);
            std::process::exit(exitcode::CANTCREAT);
        }
    }
}

fn main() {
    //initialize logging for our benefit later
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    //this is the CLI block, params that get populated appear before
    let reads_fn: String;
    let consensus_fn: String;
    let mut threads: usize = 1;
    let verbose_mode: bool;
    let mut assembler_params: AssemblerParameters = Default::default();
    let mut variant_params: VariantCallerParameters = Default::default();

    let matches = App::new("migcall")
        .version(VERSION.unwrap_or("?"))
        .about("Assembles molecular identifier groups into consensus reads and calls variants")
        .arg(Arg::with_name("verbose_mode")
            .short("v")
            .long("verbose")
            .help("enable verbose output"))
        .arg(Arg::with_name("threads")
            .short("t")
            .long("threads")
            .takes_value(true)
            .help("number of assembly threads (default: 1)"))
        .arg(Arg::with_name("mate2")
            .short("2")
            .long("mate2")
            .takes_value(true)
            .requires("mate2_output")
            .help("FASTX file with the second mate reads"))
        .arg(Arg::with_name("mate2_output")
            .long("mate2-output")
            .takes_value(true)
            .help("FASTQ file to write second mate consensus reads to"))
        .arg(Arg::with_name("reference")
            .short("r")
            .long("reference")
            .takes_value(true)
            .help("FASTA file with references to call variants against"))
        .arg(Arg::with_name("variants")
            .long("variants")
            .takes_value(true)
            .requires("reference")
            .help("TSV file to write called variants to"))
        .arg(Arg::with_name("minor_stats")
            .long("minor-stats")
            .takes_value(true)
            .help("TSV file to write minor caller statistics to"))
        .arg(Arg::with_name("summary")
            .long("summary")
            .takes_value(true)
            .help("JSON file to write the run summary to"))
        .arg(Arg::with_name("cqs_rescue")
            .long("cqs-rescue")
            .help("realign dropped reads against the consensus"))
        .arg(Arg::with_name("no_quality_trimming")
            .long("no-quality-trimming")
            .help("disable trimming of low quality consensus ends"))
        .arg(Arg::with_name("no_greedy_extend")
            .long("no-greedy-extend")
            .help("use the average read extent instead of the largest one"))
        .arg(Arg::with_name("dummy_minor_caller")
            .long("dummy-minor-caller")
            .help("report every minor instead of running the Poisson test"))
        .arg(Arg::with_name("error_model")
            .long("error-model")
            .takes_value(true)
            .possible_values(&["binomial", "minor"])
            .help("background error model for variant scoring (default: minor)"))
        .arg(Arg::with_name("READS.FQ")
            .help("The FASTX file with UMI tagged reads")
            .required(true)
            .index(1))
        .arg(Arg::with_name("CONSENSUS.FQ")
            .help("The FASTQ file to write consensus reads to")
            .required(true)
            .index(2))
        .get_matches();

    //pull out required values
    reads_fn = matches.value_of("READS.FQ").unwrap().to_string();
    consensus_fn = matches.value_of("CONSENSUS.FQ").unwrap().to_string();

    //now check options
    verbose_mode = matches.is_present("verbose_mode");
    threads = value_t!(matches.value_of("threads"), usize).unwrap_or(threads);
    assembler_params.cqs_rescue = matches.is_present("cqs_rescue");
    assembler_params.quality_trimming = !matches.is_present("no_quality_trimming");
    assembler_params.greedy_extend = !matches.is_present("no_greedy_extend");
    if let Some(model) = matches.value_of("error_model") {
        variant_params.error_model_type = match model.parse::<ErrorModelType>() {
            Ok(t) => t,
            Err(e) => {
                error!("{}", e);
                std::process::exit(exitcode::CONFIG);
            }
        };
    }
    let mate2_fn: Option<String> = matches.value_of("mate2").map(|s| s.to_string());
    let mate2_out_fn: Option<String> = matches.value_of("mate2_output").map(|s| s.to_string());
    let reference_fn: Option<String> = matches.value_of("reference").map(|s| s.to_string());

    info!("Input parameters (required):");
    info!("\tInput reads: \"{}\"", reads_fn);
    match File::open(&reads_fn) {
        Ok(_) => {},
        Err(e) => {
            error!("Failed to open input reads file: {:?}", e);
            std::process::exit(exitcode::NOINPUT);
        }
    };
    if let Some(fn2) = &mate2_fn {
        info!("\tMate 2 reads: \"{}\"", fn2);
        match File::open(fn2) {
            Ok(_) => {},
            Err(e) => {
                error!("Failed to open mate 2 reads file: {:?}", e);
                std::process::exit(exitcode::NOINPUT);
            }
        };
    }
    info!("\tOutput consensus reads: \"{}\"", consensus_fn);

    info!("Execution Parameters:");
    info!("\tverbose: {}", verbose_mode);
    info!("\tthreads: {}", threads);
    if threads == 0 {
        error!("--threads must be at least 1");
        std::process::exit(exitcode::CONFIG);
    }
    info!("Assembly Parameters:");
    info!("\t{:?}", assembler_params);
    let assembler_1: Assembler = match Assembler::new(assembler_params.clone()) {
        Ok(a) => a,
        Err(e) => {
            error!("Invalid assembly parameters: {}", e);
            std::process::exit(exitcode::CONFIG);
        }
    };
    //parameters were already checked above
    let assembler_2: Option<Assembler> = mate2_fn.as_ref().and_then(|_| Assembler::new(assembler_params.clone()).ok());
    let variant_caller: Option<VariantCaller> = match &reference_fn {
        Some(_) => {
            info!("Variant Parameters:");
            info!("\t{:?}", variant_params);
            match VariantCaller::new(variant_params.clone()) {
                Ok(vc) => Some(vc),
                Err(e) => {
                    error!("Invalid variant calling parameters: {}", e);
                    std::process::exit(exitcode::CONFIG);
                }
            }
        },
        None => None
    };

    let new_minor_caller = || -> MinorCaller {
        if matches.is_present("dummy_minor_caller") {
            MinorCaller::Dummy
        } else {
            MinorCaller::poisson(
                assembler_params.pcr_minor_test_p_value,
                stats_util::phred_to_error(assembler_params.minor_quality_threshold as f64)
            )
        }
    };

    //assemble each mate with its own accumulator
    info!("Starting MIG assembly processes...");
    let keep: bool = reference_fn.is_some();
    let arc_assembler_1: Arc<Assembler> = Arc::new(assembler_1);
    let arc_minor_caller_1: Arc<MinorCaller> = Arc::new(new_minor_caller());
    let migs_1: Vec<Mig> = load_migs(&reads_fn);
    let mut consensus_reads: Vec<Consensus> = assemble_migs(
        migs_1, &consensus_fn, arc_assembler_1.clone(), arc_minor_caller_1.clone(), threads, verbose_mode, keep
    );

    let mut arc_assembler_2: Option<Arc<Assembler>> = None;
    let mut arc_minor_caller_2: Option<Arc<MinorCaller>> = None;
    if let (Some(fn2), Some(out2), Some(assembler)) = (&mate2_fn, &mate2_out_fn, assembler_2) {
        let arc_assembler: Arc<Assembler> = Arc::new(assembler);
        let arc_minor_caller: Arc<MinorCaller> = Arc::new(new_minor_caller());
        let migs_2: Vec<Mig> = load_migs(fn2);
        consensus_reads.extend(assemble_migs(
            migs_2, out2, arc_assembler.clone(), arc_minor_caller.clone(), threads, verbose_mode, keep
        ));
        arc_assembler_2 = Some(arc_assembler);
        arc_minor_caller_2 = Some(arc_minor_caller);
    }

    //all workers are done, merge the mates into one view
    let minor_caller: MinorCaller = match &arc_minor_caller_2 {
        Some(mc2) => arc_minor_caller_1.combine(mc2),
        None => arc_minor_caller_1.combine(&new_minor_caller())
    };
    info!("Assembly summary:");
    info!("\tmate 1: {}/{} MIGs assembled", arc_assembler_1.stats().migs_assembled(), arc_assembler_1.stats().migs_total());
    if let Some(a2) = &arc_assembler_2 {
        info!("\tmate 2: {}/{} MIGs assembled", a2.stats().migs_assembled(), a2.stats().migs_total());
    }
    debug!("{}", AssemblerStats::header());
    debug!("{}", arc_assembler_1.stats().body());

    if let Some(stats_fn) = matches.value_of("minor_stats") {
        let mut stats_writer = create_output(stats_fn, "minor statistics");
        match writeln!(stats_writer, "{}\n{}", MinorCaller::header(), minor_caller.body()) {
            Ok(()) => {},
            Err(e) => {
                error!("Failed while writing minor statistics: {:?}", e);
                std::process::exit(exitcode::IOERR);
            }
        };
    }

    //place consensus reads and call variants
    let mut variants: Vec<Variant> = vec![];
    let mut placed: u64 = 0;
    if let (Some(ref_fn), Some(caller)) = (&reference_fn, &variant_caller) {
        let mut tables: Vec<MutationsTable> = load_references(ref_fn);
        let aligner: LocalAligner = Default::default();
        for consensus in consensus_reads.iter() {
            if place_consensus(&aligner, &mut tables, consensus) {
                placed += 1;
            }
        }
        info!("Placed {} of {} consensus reads on references", placed, consensus_reads.len());

        let minor_matrix: MinorMatrix = MinorMatrix::from_tables(&tables, Some(&minor_caller));
        for table in tables.iter() {
            variants.extend(caller.call(table, &minor_matrix));
        }
        sort_variants(&mut variants);
        let passed: usize = variants.iter().filter(|v| v.filter_summary == "PASS").count();
        info!("Called {} variants, {} passing filters", variants.len(), passed);

        if let Some(variants_fn) = matches.value_of("variants") {
            let mut variant_writer = create_output(variants_fn, "variants");
            let mut write_result = writeln!(variant_writer, "{}", Variant::HEADER);
            for v in variants.iter() {
                if write_result.is_err() {
                    break;
                }
                write_result = writeln!(variant_writer, "{}", v.to_row());
            }
            match write_result.and_then(|_| variant_writer.flush()) {
                Ok(()) => {},
                Err(e) => {
                    error!("Failed while writing variants: {:?}", e);
                    std::process::exit(exitcode::IOERR);
                }
            };
        }
    }

    if let Some(summary_fn) = matches.value_of("summary") {
        let summary = json!({
            "version": VERSION.unwrap_or("?"),
            "parameters": {
                "offset_range": assembler_params.offset_range,
                "anchor_region": assembler_params.anchor_region,
                "max_mms": assembler_params.max_mms,
                "max_consequent_mms": assembler_params.max_consequent_mms,
                "max_dropped_reads_ratio": assembler_params.max_dropped_reads_ratio,
                "max_dropped_reads_ratio_after_rescue": assembler_params.max_dropped_reads_ratio_after_rescue,
                "max_trimmed_consensus_bases_ratio": assembler_params.max_trimmed_consensus_bases_ratio,
                "min_matched_bases_in_realigned_read_ratio": assembler_params.min_matched_bases_in_realigned_read_ratio,
                "pcr_minor_test_p_value": assembler_params.pcr_minor_test_p_value,
                "cqs_rescue": assembler_params.cqs_rescue,
                "quality_trimming": assembler_params.quality_trimming,
                "greedy_extend": assembler_params.greedy_extend
            },
            "mate1": stats_json(arc_assembler_1.stats()),
            "mate2": arc_assembler_2.as_ref().map(|a| stats_json(a.stats())),
            "geometric_mean_mig_size": minor_caller.geometric_mean_mig_size(),
            "consensus_placed": placed,
            "variants_called": variants.len()
        });
        let mut summary_writer = create_output(summary_fn, "summary");
        let write_result: std::io::Result<()> = match serde_json::to_writer_pretty(&mut summary_writer, &summary) {
            Ok(()) => summary_writer.flush(),
            Err(e) => Err(e.into())
        };
        match write_result {
            Ok(()) => {},
            Err(e) => {
                error!("Failed while writing summary: {:?}", e);
                std::process::exit(exitcode::IOERR);
            }
        };
    }

    info!("Finished processing");
}
