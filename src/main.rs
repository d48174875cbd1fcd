use clap::Parser;
use crossbeam_channel::{bounded, Receiver as ChannelReceiver};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flowpipe::cli::{self, Command, SortArgs};
use flowpipe::config::{self, Config, ProbeConfig, ProbeSource};
use flowpipe::ingest::file::spawn_file_source;
use flowpipe::ingest::{Probe, ProbeStats, RecordEmitter, Registry};
use flowpipe::record::FlowRecord;
use flowpipe::sort::key::available_fields;
use flowpipe::sort::{KeyDescriptor, KeyFieldRegistry, Sorter};
use flowpipe::stats::{self, CollectReport, ProbeReport};
use flowpipe::stream::{FlowFileWriter, RecordSink};

/// How often the collector wakes to check for shutdown and statistics.
const TICK: Duration = Duration::from_millis(200);

fn main() {
    let args = cli::Cli::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
        eprintln!("\nInterrupt received, shutting down...");
    }) {
        tracing::warn!("cannot install Ctrl-C handler: {}", e);
    }

    let result = match &args.command {
        Command::Collect(_) => run_collect(&config, &shutdown),
        Command::Sort(sort) => run_sort(sort, &config, &shutdown),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// Read the config file, then apply command-line overrides.
fn load_config(args: &cli::Cli) -> Result<Config, config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match &args.command {
        Command::Collect(a) => {
            let collect = &mut config.collect;
            if let Some(value) = &a.output {
                collect.output = Some(value.clone());
            }
            if let Some(value) = a.stats_interval {
                collect.stats_interval_secs = value;
            }
            if let Some(value) = &a.stats_json {
                collect.stats_json = Some(value.clone());
            }
            if !a.listen.is_empty() || a.unix_socket.is_some() || a.pdu_file.is_some() {
                config.probes.push(ProbeConfig {
                    name: a.probe_name.clone(),
                    listen: a.listen.clone(),
                    unix_socket: a.unix_socket.clone(),
                    file: a.pdu_file.clone(),
                    accept_from: a.accept_from.clone(),
                    log_flags: a.log_flags.clone(),
                    ..ProbeConfig::default()
                });
            }
        }
        Command::Sort(a) => {
            let sort = &mut config.sort;
            if let Some(value) = &a.fields {
                sort.fields = Some(value.clone());
            }
            if a.reverse {
                sort.reverse = true;
            }
            if a.presorted_input {
                sort.presorted = true;
            }
            if let Some(value) = a.sort_buffer_size {
                sort.buffer_size = value;
            }
            if let Some(value) = &a.temp_directory {
                sort.temp_dir = Some(value.clone());
            }
            if let Some(value) = a.max_merge_files {
                sort.max_merge_files = value;
            }
        }
    }
    Ok(config)
}

fn output_writer(path: Option<&PathBuf>) -> io::Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    })
}

struct ProbeHandle {
    probe: Arc<Probe>,
    consumer: JoinHandle<u64>,
    totals: ProbeStats,
}

impl ProbeHandle {
    fn roll_stats(&mut self) {
        let interval = self.probe.log_stats_and_clear();
        self.totals.accumulate(&interval);
    }
}

fn spawn_consumer(probe: Arc<Probe>, tx: crossbeam_channel::Sender<FlowRecord>) -> io::Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name(format!("fp-probe-{}", probe.name()))
        .spawn(move || {
            let mut emitter = RecordEmitter::new(probe);
            let mut sent = 0u64;
            while let Some(rec) = emitter.next_record() {
                if tx.send(rec).is_err() {
                    tracing::warn!("'{}': writer has gone away", emitter.probe().name());
                    emitter.probe().stop();
                    break;
                }
                sent += 1;
            }
            sent
        })
}

fn spawn_writer(
    rx: ChannelReceiver<FlowRecord>,
    sink: Box<dyn Write + Send>,
) -> io::Result<JoinHandle<io::Result<u64>>> {
    thread::Builder::new()
        .name("fp-writer".into())
        .spawn(move || {
            let mut writer = FlowFileWriter::new(sink)?;
            for rec in rx {
                writer.write_record(&rec)?;
            }
            let written = writer.records_written();
            writer.finish()?.flush()?;
            Ok(written)
        })
}

/// Collect loop: start every probe, fan records into one writer, log
/// statistics on the configured interval and shut down on Ctrl-C or once
/// every probe has drained.
fn run_collect(config: &Config, shutdown: &Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    if config.probes.is_empty() {
        return Err("no probes configured; use --listen, --unix-socket, --pdu-file or [[probe]]".into());
    }

    let started = Instant::now();
    let started_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut registry = Registry::new(config.collect.socket_buffers());
    let mut file_probes = Vec::new();
    let mut probes = Vec::new();
    for pc in &config.probes {
        let probe = Probe::new(pc.options()?);
        match pc.source()? {
            ProbeSource::Listen(spec) => registry.register(probe.clone(), spec, pc.accept_hosts()?)?,
            ProbeSource::File(path) => file_probes.push((probe.clone(), path)),
        }
        probes.push(probe);
    }

    let (tx, rx) = bounded::<FlowRecord>(config.collect.channel_capacity.max(1));
    let writer = spawn_writer(rx, output_writer(config.collect.output.as_ref())?)?;

    let mut handles = Vec::with_capacity(probes.len());
    for probe in &probes {
        handles.push(ProbeHandle {
            probe: probe.clone(),
            consumer: spawn_consumer(probe.clone(), tx.clone())?,
            totals: ProbeStats::default(),
        });
    }
    drop(tx);

    registry.start()?;
    let mut feeders = Vec::with_capacity(file_probes.len());
    for (probe, path) in &file_probes {
        feeders.push(spawn_file_source(probe.clone(), path)?);
    }

    tracing::info!(
        "Collecting from {} probe(s) over {} receiver(s)",
        probes.len(),
        registry.receiver_count()
    );

    let interval = Duration::from_secs(config.collect.stats_interval_secs);
    let mut last_stats = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(TICK);
        if !interval.is_zero() && last_stats.elapsed() >= interval {
            for h in &mut handles {
                h.roll_stats();
            }
            last_stats = Instant::now();
        }
        if handles.iter().all(|h| h.consumer.is_finished()) {
            tracing::info!("All probes finished");
            break;
        }
    }

    if let Err(e) = registry.stop() {
        tracing::error!("{}", e);
    }
    for (probe, _) in &file_probes {
        if shutdown.load(Ordering::SeqCst) {
            probe.stop();
        }
    }
    for feeder in feeders {
        match feeder.join() {
            Ok(Ok(blocks)) => tracing::debug!("File source read {} PDU blocks", blocks),
            Ok(Err(e)) => tracing::warn!("File source failed: {}", e),
            Err(_) => tracing::error!("File source thread panicked"),
        }
    }

    let mut reports = Vec::with_capacity(handles.len());
    for h in handles {
        let ProbeHandle {
            probe,
            consumer,
            mut totals,
        } = h;
        match consumer.join() {
            Ok(sent) => tracing::debug!("'{}': emitted {} records", probe.name(), sent),
            Err(_) => tracing::error!("'{}': consumer thread panicked", probe.name()),
        }
        totals.accumulate(&probe.log_stats_and_clear());
        reports.push(ProbeReport::new(probe.name(), totals));
    }

    let written = match writer.join() {
        Ok(result) => result?,
        Err(_) => return Err("writer thread panicked".into()),
    };
    tracing::info!("Wrote {} records", written);

    let report = CollectReport {
        started: started_unix,
        elapsed_secs: started.elapsed().as_secs_f64(),
        records_written: written,
        probes: reports,
    };
    let total = report.total();
    tracing::info!(
        "Total: {} PDUs ({} bad), {} records, {} missing, {} bad",
        total.processed_pdus,
        total.bad_pdus,
        total.good_records,
        total.missing_records,
        total.bad_records
    );
    if let Some(path) = &config.collect.stats_json {
        stats::write_json(path, &report)?;
        tracing::info!("Statistics written to {}", path.display());
    }
    Ok(())
}

fn run_sort(
    args: &SortArgs,
    config: &Config,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = KeyFieldRegistry::with_bundled();
    if args.list_fields {
        println!("{}", available_fields(&registry).replace(',', "\n"));
        return Ok(());
    }

    let fields = config
        .sort
        .fields
        .as_deref()
        .ok_or("--fields is required")?;
    let key = KeyDescriptor::parse(fields, &registry, config.sort.reverse)?;
    if args.inputs.is_empty() {
        return Err("no input files given".into());
    }
    tracing::info!(
        "Sorting {} file(s) by {}{}",
        args.inputs.len(),
        key.field_names().join(","),
        if key.reverse() { " (reversed)" } else { "" }
    );

    let sorter = Sorter::new(key, config.sort.options()).with_cancel(shutdown.clone());
    let mut out = FlowFileWriter::new(output_writer(args.output_path.as_ref())?)?;
    let summary = sorter.sort_files(&args.inputs, &mut out)?;
    out.finish()?.flush()?;
    tracing::info!(
        "Sorted {} records ({} temp runs, {} merge passes)",
        summary.records_out,
        summary.runs,
        summary.merge_passes
    );
    Ok(())
}
