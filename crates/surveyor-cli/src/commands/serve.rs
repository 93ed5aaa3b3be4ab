use std::sync::Arc;

pub fn run(host: &str, port: u16, config_path: Option<&str>, state_dir: Option<&str>, shadow: bool) {
    let mut config = super::load_config(config_path);
    if shadow {
        config.shadow_mode_enabled = true;
    }
    let shadow_mode = config.shadow_mode_enabled;
    let engine = Arc::new(super::make_engine(config, state_dir));

    let base = format!("http://{host}:{port}");
    let model = engine.model_snapshot();

    println!("🔎 Surveyor Decision Server v{}", surveyor_core::VERSION);
    println!("   {base}");
    println!(
        "   model v{} ({} observations), {} known strata",
        model.version,
        model.observation_count,
        engine.strata().len()
    );
    match state_dir {
        Some(dir) => println!("   state: {dir}"),
        None => println!("   state: in-memory (lost on exit)"),
    }
    if shadow_mode {
        println!("   SHADOW MODE: every decision is enacted as escalate");
    }
    println!();
    println!("   Endpoints:");
    println!("     GET  /                 API index (try: curl {base})");
    println!("     POST /api/v1/evaluate  Decide automate/escalate for one assessment");
    println!("     POST /api/v1/outcome   Submit a labelled outcome");
    println!("     GET  /strata           Per-stratum calibration and FNR");
    println!("     GET  /model            Current bandit model snapshot");
    println!("     GET  /health           Health check");
    println!();

    let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| super::fail(e));
    if let Err(e) = rt.block_on(surveyor_server::run_server(engine, host, port)) {
        super::fail(format!("server on {base} stopped: {e}"));
    }
}
