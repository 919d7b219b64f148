// engine: hosts the Framer, the configured FIX/iLink3 sessions, and the
// Engine<->Library handoff.

use tracing::info;
use vg_channel::TcpChannelSupplier;
use vg_clock::{system_clock, BackoffIdleStrategy, IdleStrategy};
use vg_framer::TracingErrorConsumer;
use vg_sequence_store::SequenceStore;

use engine::runtime::EngineRuntime;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "engine starting");

    let cfg = match engine::config::load_config() {
        Ok(cfg) => {
            info!(
                fix_sessions = cfg.fix_sessions.len(),
                ilink3_sessions = cfg.ilink3_sessions.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let store = match SequenceStore::open(std::path::Path::new(&cfg.store.sqlite_path)) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("FATAL: failed to open sequence store: {e}");
            std::process::exit(1);
        }
    };

    let mut runtime = EngineRuntime::start(
        cfg,
        system_clock(),
        Box::new(TcpChannelSupplier::new()),
        store,
        Box::new(TracingErrorConsumer),
    );

    // No signal-driven shutdown here: the Framer is a synchronous poll loop
    // with no async runtime to select! against. Process supervision
    // (systemd, a container orchestrator) is expected to send SIGTERM and
    // the OS reclaims sockets on exit; `begin_close()` exists for the path
    // that matters most — tests and `library-harness` driving it directly.
    let idle_strategy = BackoffIdleStrategy::default();
    let mut cycles_since_metrics_log = 0u64;
    loop {
        let work_done = runtime.duty_cycle();
        idle_strategy.idle(work_done);

        cycles_since_metrics_log += 1;
        if cycles_since_metrics_log >= 100_000 {
            runtime.metrics().log();
            cycles_since_metrics_log = 0;
        }
    }
}
