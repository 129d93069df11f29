#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use bgs_core::{BlockGroups, SEARCH_BUFFER_BUDGET, ScanConfig, ScanStats};
use bgs_error::BgsError;
use bgs_search::{ImageTransport, SearchTransport};
use serde::Serialize;
use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::{Subscriber, debug};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    /// One `.` per block group, then a newline.
    Dots,
    /// One `start length` line per block group.
    List,
    /// A JSON summary after the scan.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Options {
    path: PathBuf,
    image: bool,
    output: Output,
    buffer_budget: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Scan(Options),
}

#[derive(Debug, Serialize)]
struct GroupOutput {
    start: u64,
    length: u64,
    transid: u64,
}

#[derive(Debug, Serialize)]
struct ScanOutput<'a> {
    path: &'a Path,
    tree_id: u64,
    block_groups: Vec<GroupOutput>,
    stats: ScanStats,
}

fn main() {
    init_tracing();
    if let Err(error) = run(env::args().skip(1)) {
        let usage = matches!(error.downcast_ref::<BgsError>(), Some(BgsError::Usage(_)));
        if usage {
            print_usage();
        }
        eprintln!("error: {error:#}");
        std::process::exit(if usage { 2 } else { 1 });
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    subscriber(filter, io::stderr, io::stderr().is_terminal()).init();
}

fn subscriber<W>(filter: EnvFilter, writer: W, ansi: bool) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(false),
    )
}

fn run(args: impl IntoIterator<Item = String>) -> Result<()> {
    match parse_args(args)? {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Scan(options) => scan(&options),
    }
}

fn print_usage() {
    println!("usage: bgs-cli <mountpoint> [--image] [--json | --list] [--buffer-size <bytes>]");
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command, BgsError> {
    let mut path = None;
    let mut image = false;
    let mut output = Output::Dots;
    let mut buffer_budget = SEARCH_BUFFER_BUDGET;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" | "help" => return Ok(Command::Help),
            "--image" => image = true,
            "--json" | "--list" => {
                let wanted = if arg == "--json" { Output::Json } else { Output::List };
                if output != Output::Dots && output != wanted {
                    return Err(BgsError::Usage("--json and --list are exclusive".into()));
                }
                output = wanted;
            }
            "--buffer-size" => {
                let Some(value) = args.next() else {
                    return Err(BgsError::Usage("--buffer-size requires a value".into()));
                };
                let invalid =
                    || BgsError::Usage(format!("invalid --buffer-size value: {value}"));
                buffer_budget = value.parse().map_err(|_| invalid())?;
                ScanConfig {
                    buffer_budget,
                    ..ScanConfig::default()
                }
                .validate()
                .map_err(|_| invalid())?;
            }
            flag if flag.starts_with('-') => {
                return Err(BgsError::Usage(format!("unknown option: {flag}")));
            }
            _ if path.is_some() => {
                return Err(BgsError::Usage(format!("unexpected argument: {arg}")));
            }
            _ => path = Some(PathBuf::from(&arg)),
        }
    }

    let Some(path) = path else {
        return Err(BgsError::Usage("missing <mountpoint>".into()));
    };
    Ok(Command::Scan(Options {
        path,
        image,
        output,
        buffer_budget,
    }))
}

fn scan(options: &Options) -> Result<()> {
    let config = ScanConfig {
        buffer_budget: options.buffer_budget,
        ..ScanConfig::default()
    };
    config.validate()?;
    debug!(path = %options.path.display(), image = options.image, "scanning");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if options.image {
        let transport = ImageTransport::open(&options.path)
            .with_context(|| format!("failed to open btrfs image {}", options.path.display()))?;
        report(&transport, config, options, &mut out)
    } else {
        scan_mounted(config, options, &mut out)
    }
}

#[cfg(target_os = "linux")]
fn scan_mounted(config: ScanConfig, options: &Options, out: &mut impl Write) -> Result<()> {
    let transport = bgs_search::IoctlTransport::open(&options.path)?;
    report(&transport, config, options, out)
}

#[cfg(not(target_os = "linux"))]
fn scan_mounted(_config: ScanConfig, _options: &Options, _out: &mut impl Write) -> Result<()> {
    anyhow::bail!("searching a mounted filesystem needs Linux; pass --image for an image file")
}

fn report<T>(
    transport: &T,
    config: ScanConfig,
    options: &Options,
    out: &mut impl Write,
) -> Result<()>
where
    T: SearchTransport + ?Sized,
{
    let mut groups = BlockGroups::with_config(transport, config)?;
    match options.output {
        Output::Dots => {
            for record in groups.by_ref() {
                if let Err(err) = record {
                    // Keep the dots already printed on their own line.
                    writeln!(out)?;
                    return Err(err.into());
                }
                write!(out, ".")?;
                out.flush()?;
            }
            writeln!(out)?;
        }
        Output::List => {
            for record in groups.by_ref() {
                let record = record?;
                writeln!(out, "{} {}", record.start(), record.length())?;
            }
        }
        Output::Json => {
            let block_groups = groups
                .by_ref()
                .map(|record| {
                    record.map(|record| GroupOutput {
                        start: record.start(),
                        length: record.length(),
                        transid: record.transid,
                    })
                })
                .collect::<Result<Vec<_>, BgsError>>()?;
            let output = ScanOutput {
                path: &options.path,
                tree_id: config.tree_id.get(),
                block_groups,
                stats: *groups.stats(),
            };
            let json = serde_json::to_string_pretty(&output).context("serialize output")?;
            writeln!(out, "{json}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgs_btrfs::fixture::ImageBuilder;
    use bgs_ondisk::BtrfsKey;
    use bgs_search::MemoryTransport;
    use bgs_types::{BTRFS_BLOCK_GROUP_ITEM_KEY, BTRFS_EXTENT_ITEM_KEY, TreeId};
    use std::sync::{Arc, Mutex};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn options(output: Output) -> Options {
        Options {
            path: PathBuf::from("/mnt/data"),
            image: false,
            output,
            buffer_budget: SEARCH_BUFFER_BUDGET,
        }
    }

    fn three_groups() -> MemoryTransport {
        let mut transport = MemoryTransport::new();
        for (objectid, item_type, offset) in [
            (0, BTRFS_EXTENT_ITEM_KEY, 4096),
            (0, BTRFS_BLOCK_GROUP_ITEM_KEY, 100),
            (100, BTRFS_BLOCK_GROUP_ITEM_KEY, 150),
            (1000, BTRFS_BLOCK_GROUP_ITEM_KEY, 100),
        ] {
            transport
                .insert(
                    TreeId::EXTENT,
                    BtrfsKey::new(objectid, item_type, offset),
                    vec![0; 24],
                )
                .expect("insert");
        }
        transport
    }

    fn render(transport: &MemoryTransport, output: Output) -> Result<String> {
        let mut out = Vec::new();
        report(transport, ScanConfig::default(), &options(output), &mut out)?;
        Ok(String::from_utf8(out).expect("utf8"))
    }

    #[test]
    fn parses_mountpoint_and_flags() {
        let command =
            parse_args(args(&["/mnt/data", "--list", "--buffer-size", "65536"])).expect("parse");
        assert_eq!(
            command,
            Command::Scan(Options {
                path: PathBuf::from("/mnt/data"),
                image: false,
                output: Output::List,
                buffer_budget: 65536,
            })
        );

        let Command::Scan(image) = parse_args(args(&["--image", "disk.img"])).expect("parse")
        else {
            panic!("expected scan");
        };
        assert!(image.image);
        assert_eq!(image.output, Output::Dots);
        assert_eq!(image.buffer_budget, 4096);
    }

    #[test]
    fn help_wins_over_other_arguments() {
        for flag in ["-h", "--help", "help"] {
            assert_eq!(parse_args(args(&["/mnt", flag])).expect("parse"), Command::Help);
        }
    }

    #[test]
    fn usage_errors() {
        for bad in [
            &[][..],
            &["--json"][..],
            &["/a", "/b"][..],
            &["/a", "--verbose"][..],
            &["/a", "--buffer-size"][..],
            &["/a", "--buffer-size", "lots"][..],
            &["/a", "--buffer-size", "0"][..],
            &["/a", "--buffer-size", "31"][..],
            &["/a", "--buffer-size", "16777217"][..],
            &["/a", "--json", "--list"][..],
        ] {
            let err = parse_args(args(bad)).unwrap_err();
            assert!(matches!(err, BgsError::Usage(_)), "{bad:?}: {err:?}");
        }
    }

    #[test]
    fn dots_one_per_group_then_newline() {
        let transport = three_groups();
        assert_eq!(render(&transport, Output::Dots).expect("render"), "...\n");
        assert_eq!(transport.searches(), 4);
    }

    #[test]
    fn empty_tree_prints_only_newline() {
        let mut transport = MemoryTransport::new();
        transport.add_tree(TreeId::EXTENT);
        assert_eq!(render(&transport, Output::Dots).expect("render"), "\n");
    }

    #[test]
    fn list_prints_start_and_length() {
        let text = render(&three_groups(), Output::List).expect("render");
        assert_eq!(text, "0 100\n100 150\n1000 100\n");
    }

    #[test]
    fn json_summary_carries_groups_and_stats() {
        let text = render(&three_groups(), Output::Json).expect("render");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["tree_id"], 2);
        assert_eq!(value["block_groups"].as_array().map(Vec::len), Some(3));
        assert_eq!(value["block_groups"][1]["start"], 100);
        assert_eq!(value["block_groups"][1]["length"], 150);
        assert_eq!(value["stats"]["searches"], 4);
        assert_eq!(value["stats"]["bytes_covered"], 350);
    }

    #[test]
    fn failed_search_still_ends_the_line() {
        // No extent tree registered: the first search fails.
        let transport = MemoryTransport::new();
        let mut out = Vec::new();
        let err = report(&transport, ScanConfig::default(), &options(Output::Dots), &mut out)
            .unwrap_err();
        assert_eq!(out, b"\n");
        let bgs = err.downcast_ref::<BgsError>().expect("BgsError");
        assert!(matches!(bgs, BgsError::SearchFailed { .. }));

        let message = format!("{err:#}");
        assert_eq!(message.matches("not found: tree 2").count(), 1, "{message}");
    }

    #[test]
    fn buffer_size_bounds_are_inclusive() {
        for (value, budget) in [("32", 32), ("16777216", 16 * 1024 * 1024)] {
            let Command::Scan(opts) =
                parse_args(args(&["/a", "--buffer-size", value])).expect("parse")
            else {
                panic!("expected scan");
            };
            assert_eq!(opts.buffer_budget, budget);
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_search_is_not_logged_at_default_level() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = subscriber(EnvFilter::new("warn"), move || writer.clone(), false);

        let err = tracing::subscriber::with_default(subscriber, || {
            report(
                &MemoryTransport::new(),
                ScanConfig::default(),
                &options(Output::Dots),
                &mut Vec::new(),
            )
            .unwrap_err()
        });
        assert!(err.downcast_ref::<BgsError>().is_some());
        let logged = captured.0.lock().expect("lock").clone();
        assert!(logged.is_empty(), "{}", String::from_utf8_lossy(&logged));
    }

    #[test]
    fn plain_log_lines_carry_no_escape_codes() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = subscriber(EnvFilter::new("warn"), move || writer.clone(), false);

        tracing::subscriber::with_default(subscriber, || tracing::warn!(errno = 5, "scan"));
        let logged = captured.0.lock().expect("lock").clone();
        let text = String::from_utf8(logged).expect("utf8");
        assert!(text.contains("scan"), "{text}");
        assert!(!text.contains('\u{1b}'), "{text:?}");
    }

    #[test]
    fn scans_image_file() {
        let image = ImageBuilder::new()
            .block_group(1024 * 1024, 4 * 1024 * 1024)
            .extent_item(1024 * 1024, 4096)
            .block_group(5 * 1024 * 1024, 8 * 1024 * 1024)
            .build();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&image).expect("write image");

        let transport = ImageTransport::open(file.path()).expect("open image");
        let mut out = Vec::new();
        report(&transport, ScanConfig::default(), &options(Output::List), &mut out)
            .expect("report");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "1048576 4194304\n5242880 8388608\n"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_mountpoint_is_handle_acquisition() {
        let opts = Options {
            path: PathBuf::from("/nonexistent/bgs-cli-mount"),
            ..options(Output::Dots)
        };
        let err = scan_mounted(ScanConfig::default(), &opts, &mut Vec::<u8>::new()).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/bgs-cli-mount"));
    }
}
