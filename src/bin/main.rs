#![deny(unused_imports)]

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{info, warn, LevelFilter};
use serde::Serialize;

use tanto::config::Config;
use tanto::download::FileDownloader;
use tanto::extract::EventExtractor;
use tanto::source::replay::{ReplayEvent, ReplaySource};
use tanto::util::uname::Utsname;

#[derive(Parser)]
#[command(author, version, about = "Runtime security telemetry collector", long_about = None)]
struct Cli {
    /// Enable debugging
    #[arg(short, long)]
    debug: bool,

    /// Silents out debug, info, error logging.
    #[arg(short, long)]
    silent: bool,

    /// Set verbosity level, repeat option for more verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
struct ReplayOpt {
    /// Specify a configuration file to use. Command line options supersede
    /// the ones specified in the configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Configuration as an inline JSON document. Supersedes --config.
    #[arg(long, value_name = "JSON")]
    collector_config: Option<String>,

    /// Collection method (kernel_module, ebpf or core_bpf).
    #[arg(long)]
    collection_method: Option<String>,

    /// Export endpoint in the form HOST:PORT.
    #[arg(long, value_name = "ADDR")]
    grpc_server: Option<String>,

    /// Event files in JSON line format, - for stdin.
    files: Vec<String>,
}

impl TryFrom<ReplayOpt> for Config {
    type Error = anyhow::Error;

    fn try_from(opt: ReplayOpt) -> Result<Self, Self::Error> {
        let mut conf = load_config(opt.collector_config.as_deref(), opt.config.as_ref())?;

        // command line supersedes configuration
        if let Some(method) = opt.collection_method {
            conf.collection_method = method.parse()?;
        }

        // supersedes configuration
        if let Some(addr) = opt.grpc_server {
            conf.set_grpc_server(&addr)?;
        }

        Ok(conf)
    }
}

#[derive(Debug, Parser)]
struct ProbeOpt {
    /// Specify a configuration file to use.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Configuration as an inline JSON document. Supersedes --config.
    #[arg(long, value_name = "JSON")]
    collector_config: Option<String>,

    /// Full probe URL. Supersedes the base URL from the configuration.
    #[arg(long)]
    url: Option<String>,

    /// Output path for the downloaded artifact.
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay captured events from JSON line files through the extraction
    /// pipeline and print one record per event
    Replay(ReplayOpt),
    /// Download the kernel probe artifact matching this host
    Probe(ProbeOpt),
    /// Dump the default configuration
    Config,
}

fn load_config(inline: Option<&str>, file: Option<&PathBuf>) -> anyhow::Result<Config> {
    let mut conf = match (inline, file) {
        (Some(json), _) => Config::from_json_str(json)?,
        (None, Some(path)) => Config::from_file(path)?,
        _ => Config::default(),
    };
    conf.handle_env_vars();
    Ok(conf)
}

#[derive(Debug, Serialize)]
struct TaskRecord<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ppid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comm: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exe: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exepath: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmdline: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ContainerRecord<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    privileged: Option<bool>,
}

#[derive(Debug, Serialize)]
struct NetworkRecord<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fd_name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Record<'a> {
    ts: DateTime<Utc>,
    host: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_uuid: Option<uuid::Uuid>,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rawres: Option<i64>,
    task: TaskRecord<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<ContainerRecord<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<NetworkRecord<'a>>,
}

fn build_record<'e>(
    extractor: &EventExtractor,
    hostname: &'e str,
    host_uuid: Option<uuid::Uuid>,
    event: &'e ReplayEvent,
) -> Record<'e> {
    let task = TaskRecord {
        pid: extractor.pid(event),
        tid: extractor.tid(event),
        ppid: extractor.ppid(event),
        uid: extractor.uid(event),
        gid: extractor.gid(event),
        comm: extractor.comm(event),
        exe: extractor.exe(event),
        exepath: extractor.exepath(event),
        cmdline: extractor.cmdline(event),
        args: extractor.proc_args(event),
        cwd: extractor.cwd(event),
        user: extractor.user_name(event),
    };

    let container = extractor
        .container_id(event)
        .filter(|id| !id.is_empty())
        .map(|id| ContainerRecord {
            id,
            privileged: extractor.container_privileged(event).map(|v| v != 0),
        });

    let client_port = extractor.client_port(event);
    let server_port = extractor.server_port(event);
    let fd_name = extractor.fd_name(event);
    let network = (client_port.is_some() || server_port.is_some() || fd_name.is_some()).then(
        || NetworkRecord {
            client_port,
            server_port,
            fd_name,
        },
    );

    Record {
        ts: event.timestamp().unwrap_or_else(Utc::now),
        host: hostname,
        host_uuid,
        event: event.name(),
        rawres: extractor.event_rawres(event),
        task,
        container,
        network,
    }
}

impl Command {
    fn replay(opt: ReplayOpt) -> anyhow::Result<()> {
        let files = if opt.files.is_empty() {
            vec!["-".to_string()]
        } else {
            opt.files.clone()
        };

        let conf: Config = opt.try_into()?;
        let hostname = conf.hostname();
        let host_uuid = conf.host_uuid();

        let mut extractor = EventExtractor::new();

        for file in files {
            // one capture source per input, the extractor is re-armed
            // against each of them
            let mut source = ReplaySource::new();
            extractor.init(&mut source);

            let reader: Box<dyn BufRead> = if file == "-" {
                Box::new(BufReader::new(io::stdin()))
            } else {
                Box::new(BufReader::new(fs::File::open(&file)?))
            };

            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }

                let event = match ReplayEvent::from_json_line(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("skipping unreadable event: {e}");
                        continue;
                    }
                };

                if !event.name().is_empty() && !conf.is_syscall_enabled(event.name()) {
                    continue;
                }

                let record = build_record(&extractor, &hostname, host_uuid, &event);
                println!("{}", serde_json::to_string(&record)?);
            }

            extractor.reset();
        }

        Ok(())
    }

    fn probe(opt: ProbeOpt) -> anyhow::Result<()> {
        let conf = load_config(opt.collector_config.as_deref(), opt.config.as_ref())?;

        let url = match opt.url {
            Some(url) => url,
            None => {
                let base = conf
                    .probe
                    .base_url
                    .clone()
                    .ok_or_else(|| anyhow!("no probe URL given and no base URL configured"))?;
                let uts = Utsname::from_sys()?;
                format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    conf.collection_method.probe_artifact(&uts.release())
                )
            }
        };

        info!("downloading {url}");
        FileDownloader::new(url)
            .output(&opt.output)
            .retries(
                conf.probe.retries,
                Duration::from_secs(conf.probe.retry_delay),
                Duration::from_secs(conf.probe.max_retry_time),
            )
            .connection_timeout(Duration::from_secs(conf.probe.connection_timeout))
            .download()?;
        info!("probe artifact written to {}", opt.output.display());

        Ok(())
    }

    fn config() -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(&Config::default())?);
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // setting log level according to the verbosity level
    let mut log_level = LevelFilter::Warn;
    match cli.verbose {
        1 => log_level = LevelFilter::Info,
        2 => log_level = LevelFilter::Debug,
        3..=u8::MAX => log_level = LevelFilter::Trace,
        _ => {}
    }

    if cli.debug {
        log_level = LevelFilter::Debug;
    }

    // silent out logging if specified in CLI
    if cli.silent {
        log_level = LevelFilter::Off;
    }

    Builder::new().filter_level(log_level).init();

    match cli.command {
        Command::Replay(o) => Command::replay(o),
        Command::Probe(o) => Command::probe(o),
        Command::Config => Command::config(),
    }
}
