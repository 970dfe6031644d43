use std::collections::HashMap;
use std::path::PathBuf;
use std::{env, process::exit};

use tracing_subscriber::EnvFilter;

use skein::loader::{Loader, LoaderConfig, LoaderError, Registry};
use skein::macho::analyze;

struct Opts {
    /// Root directory dependency paths resolve against.
    deps_root: Option<PathBuf>,

    /// The binary to load.
    binary: String,
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: skein [--deps-root <dir>] <binary>");
        exit(1);
    }
    let opts = parse_opts(&args);

    if let Err(err) = run(&opts) {
        eprintln!("skein: {err}");
        exit(1);
    }
}

fn run(opts: &Opts) -> skein::Result<()> {
    let path = PathBuf::from(&opts.binary);
    let results = analyze(&path)?;
    let Some((mut reader, image)) = results.into_iter().find(|(_, image)| image.is_arm64()) else {
        return Err(LoaderError::NoMatchingArch(opts.binary.clone()).into());
    };

    let config = LoaderConfig {
        deps_root: opts
            .deps_root
            .clone()
            .or_else(|| env::var_os("SKEIN_DEPS_ROOT").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    // No native implementations are registered by the CLI; binds resolve
    // from loaded libraries only.
    let builtins = HashMap::new();
    let mut registry = Registry::new();
    let loaded = {
        let mut loader = Loader::new(config, &builtins, &mut registry);
        loader.load(image, &mut reader)?
    };

    // Running the image is the execution component's job; report what it
    // would receive.
    match loaded.entry {
        Some(entry) => println!(
            "{}: loaded at {:#x}, entry {:#x}, {} symbols, {} libraries",
            loaded.name,
            loaded.base_address(),
            entry,
            loaded.symbols.len(),
            registry.len(),
        ),
        None => println!(
            "{}: library loaded at {:#x}, {} symbols",
            loaded.name,
            loaded.base_address(),
            loaded.symbols.len(),
        ),
    }
    Ok(())
}

fn parse_opts(args: &[String]) -> Opts {
    let mut deps_root = None;
    let mut binary = String::new();
    let mut i = 1; // Skip program name
    while i < args.len() {
        if args[i] == "--deps-root" && i + 1 < args.len() {
            deps_root = Some(PathBuf::from(&args[i + 1]));
            i += 2;
        } else if binary.is_empty() {
            binary = args[i].clone();
            i += 1;
        } else {
            i += 1;
        }
    }
    Opts { deps_root, binary }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
