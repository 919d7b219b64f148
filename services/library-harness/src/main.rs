// library-harness: a self-contained demonstration of the Engine<->Library
// protocol (C9) — pairs an in-memory transport between an in-process Engine
// runtime and a Library client and drives both sides' duty cycles. The real
// inter-process transport is out of scope (spec §1's shared-memory-transport
// Non-goal); this binary exists to exercise the protocol end to end without
// it, the same role a race-timing emulator plays for real reader hardware.

use clap::{Arg, Command};
use tracing::info;
use vg_clock::system_clock;
use vg_engine_protocol::{test_support::pair, SessionId};
use vg_sequence_store::SequenceStore;

use engine::runtime::EngineRuntime;
use library_harness::LibraryClient;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "library-harness starting");

    let matches = Command::new("library-harness")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Drives the Engine<->Library protocol from the Library side against an in-process Engine")
        .arg(
            Arg::new("config")
                .help("Path to the engine.toml this harness's in-process Engine should load")
                .short('c')
                .long("config")
                .required(true),
        )
        .arg(
            Arg::new("library_id")
                .help("Library identifier to CONNECT as")
                .short('l')
                .long("library-id")
                .default_value("harness"),
        )
        .arg(
            Arg::new("cycles")
                .help("Number of duty cycles to run before exiting")
                .long("cycles")
                .default_value("1000"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("required");
    let library_id = matches.get_one::<String>("library_id").cloned().unwrap_or_else(|| "harness".to_owned());
    let cycles: u64 = matches.get_one::<String>("cycles").and_then(|s| s.parse().ok()).unwrap_or(1000);

    let cfg = match engine::config::load_config_from_path(std::path::Path::new(config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let store = SequenceStore::open_in_memory().expect("in-memory sequence store always opens");
    let mut engine_runtime = EngineRuntime::start(
        cfg,
        system_clock(),
        Box::new(vg_channel::TcpChannelSupplier::new()),
        store,
        Box::new(vg_framer::TracingErrorConsumer),
    );

    let (engine_transport, library_transport) = pair();
    engine_runtime.attach_library(Box::new(engine_transport));
    let mut client = LibraryClient::new(library_transport, library_id.clone());
    client.connect().expect("in-memory transport never disconnects this early");

    for _ in 0..cycles {
        engine_runtime.duty_cycle();
        for message in client.poll() {
            info!(?message, "engine message");
        }
    }

    client.request_session(SessionId(1)).expect("transport still connected");
    engine_runtime.duty_cycle();
    for message in client.poll() {
        info!(?message, "engine message");
    }

    info!(library_id, "library-harness finished");
}
