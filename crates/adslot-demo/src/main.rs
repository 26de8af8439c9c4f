use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use adslot::{
    AdBackend, AdEvent, AdFormat, AdSize, AdSlotController, AdUnitId, ErrorDescriptor,
    FullScreenPresenter, HostDisplay, PreloadConfig, PreloadListener, PreloadPool,
    SimulatedBackend, SlotConfig, SlotUpdate, TracingSink,
};
use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const BANNER_UNIT_ID: &str = "ca-app-pub-3940256099942544/9214589741";
const REWARDED_UNIT_ID: &str = "ca-app-pub-3940256099942544/5224354917";
const APP_OPEN_UNIT_ID: &str = "ca-app-pub-3940256099942544/9257395921";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Banner,
    Preload,
    AppOpen,
    All,
}

struct Args {
    scenario: Scenario,
    display: HostDisplay,
    no_fill: bool,
    config: Option<PathBuf>,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("ADSLOT_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("adslot={level},adslot_demo={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn usage() {
    eprintln!("Usage: adslot-demo [--scenario banner|preload|app-open|all] [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <name>   Scenario to run [default: all]");
    eprintln!("  --width-px <px>     Host display width in pixels [default: 1080]");
    eprintln!("  --density <d>       Host display density [default: 2.625]");
    eprintln!("  --no-fill           Make the first banner load fail with NO_FILL");
    eprintln!("  --config <file>     Banner slot configuration (JSON)");
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut scenario = Scenario::All;
    let mut width_px: u32 = 1080;
    let mut density: f32 = 2.625;
    let mut no_fill = false;
    let mut config = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--scenario" => {
                i += 1;
                scenario = match args.get(i).map(String::as_str) {
                    Some("banner") => Scenario::Banner,
                    Some("preload") => Scenario::Preload,
                    Some("app-open") => Scenario::AppOpen,
                    Some("all") => Scenario::All,
                    Some(other) => return Err(format!("unknown scenario: {other}")),
                    None => return Err("--scenario requires a value".to_string()),
                };
            }
            "--width-px" => {
                i += 1;
                width_px = args
                    .get(i)
                    .ok_or("--width-px requires a value")?
                    .parse()
                    .map_err(|e| format!("invalid --width-px: {e}"))?;
            }
            "--density" => {
                i += 1;
                density = args
                    .get(i)
                    .ok_or("--density requires a value")?
                    .parse()
                    .map_err(|e| format!("invalid --density: {e}"))?;
            }
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(args.get(i).ok_or("--config requires a value")?));
            }
            "--no-fill" => no_fill = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Args {
        scenario,
        display: HostDisplay::new(width_px, density),
        no_fill,
        config,
    })
}

async fn next_update(controller: &mut AdSlotController) -> anyhow::Result<SlotUpdate> {
    tokio::time::timeout(Duration::from_secs(5), controller.next_event())
        .await
        .context("timed out waiting for slot event")
}

async fn run_banner(backend: &Arc<SimulatedBackend>, args: &Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            SlotConfig::from_json(&json)?
        }
        None => {
            let mut config = SlotConfig::new(BANNER_UNIT_ID, AdFormat::Banner);
            config.sizes.push(AdSize::adaptive());
            config
        }
    };

    let host_width = args
        .display
        .logical_width()
        .context("display density must be positive")?;
    let request = config.request(Some(host_width))?;
    tracing::info!(
        unit_id = %request.unit_id(),
        size = ?request.primary_size(),
        "Built banner request"
    );

    if args.no_fill {
        backend.push_failure(ErrorDescriptor::no_fill());
    }

    let mut controller = AdSlotController::new(
        Arc::clone(backend) as Arc<dyn AdBackend>,
        Arc::new(TracingSink::new("banner")),
    );
    controller.attach("ad_view_container")?;

    controller.load(request.clone())?;
    if let SlotUpdate::FailedToLoad(err) = next_update(&mut controller).await? {
        tracing::warn!(error = %err, "Retrying banner load");
        controller.load(request)?;
        next_update(&mut controller).await?;
    }

    if let Some(ad_id) = controller.handle().map(|h| h.id()) {
        backend.emit(ad_id, AdEvent::Impression);
        backend.emit(ad_id, AdEvent::Refreshed);
        backend.emit(
            ad_id,
            AdEvent::FailedToRefresh(ErrorDescriptor::new(
                ErrorDescriptor::NETWORK_ERROR,
                "refresh timed out",
            )),
        );
        for _ in 0..3 {
            next_update(&mut controller).await?;
        }
    }

    tracing::info!(state = controller.state().as_str(), "Banner slot settled");
    controller.detach();
    controller.destroy();
    Ok(())
}

async fn run_preload(backend: &Arc<SimulatedBackend>) -> anyhow::Result<()> {
    let listener = Arc::new(TracingSink::new("rewarded"));
    let pool = PreloadPool::new(Arc::clone(backend) as Arc<dyn AdBackend>)
        .with_listener(listener as Arc<dyn PreloadListener>);

    let unit_id = AdUnitId::new(REWARDED_UNIT_ID)?;
    let request = adslot::AdSlotRequest::builder(REWARDED_UNIT_ID)
        .format(AdFormat::Rewarded)
        .build()?;
    pool.start_preloading(unit_id.clone(), PreloadConfig::new(request).with_capacity(2))?;

    for round in 1..=4 {
        tokio::time::sleep(Duration::from_millis(120)).await;
        match pool.poll_ad(&unit_id) {
            Some(ad) => {
                let age_ms = ad.age().as_millis() as u64;
                tracing::info!(
                    round,
                    ad_id = %ad.handle().id(),
                    response_id = %ad.handle().response_info().response_id,
                    age_ms,
                    "Polled rewarded ad"
                );
                backend.destroy(ad.into_handle());
            }
            None => tracing::info!(round, "No preloaded rewarded ads available"),
        }
        if let Some(stats) = pool.stats(&unit_id) {
            tracing::info!(stats = %serde_json::to_string(&stats)?, "Pool state");
        }
    }

    pool.stop_preloading(&unit_id);
    Ok(())
}

async fn run_app_open(backend: &Arc<SimulatedBackend>) -> anyhow::Result<()> {
    let pool = Arc::new(PreloadPool::new(Arc::clone(backend) as Arc<dyn AdBackend>));
    let unit_id = AdUnitId::new(APP_OPEN_UNIT_ID)?;
    let request = adslot::AdSlotRequest::builder(APP_OPEN_UNIT_ID)
        .format(AdFormat::AppOpen)
        .build()?;
    pool.start_preloading(unit_id.clone(), PreloadConfig::new(request).with_capacity(1))?;

    let presenter = FullScreenPresenter::new(
        unit_id,
        Arc::clone(&pool),
        Arc::clone(backend) as Arc<dyn AdBackend>,
        Arc::new(TracingSink::new("app_open")),
    );

    // Cold start: the ad is usually not preloaded yet.
    let outcome = presenter.show_if_available(|| tracing::info!("Continuing to app content"));
    tracing::info!(?outcome, "App open attempt");

    tokio::time::sleep(Duration::from_millis(150)).await;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let outcome = presenter.show_if_available(move || {
        let _ = done_tx.send(());
    });
    tracing::info!(?outcome, "App open attempt");

    tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .context("app open presentation did not finish")?
        .context("presentation dropped its completion")?;

    pool.stop_all();
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let backend = Arc::new(
        SimulatedBackend::new()
            .with_latency(Duration::from_millis(40))
            .with_auto_dismiss(Duration::from_millis(200)),
    );

    if matches!(args.scenario, Scenario::Banner | Scenario::All) {
        run_banner(&backend, &args).await?;
    }
    if matches!(args.scenario, Scenario::Preload | Scenario::All) {
        run_preload(&backend).await?;
    }
    if matches!(args.scenario, Scenario::AppOpen | Scenario::All) {
        run_app_open(&backend).await?;
    }

    tracing::info!(
        loads = backend.load_calls(),
        live = backend.live_count(),
        "Simulated backend summary"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("adslot-demo")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_defaults() {
        let args = parse_args(&argv(&[])).unwrap();
        assert_eq!(args.scenario, Scenario::All);
        assert_eq!(args.display.logical_width(), Some(411));
        assert!(!args.no_fill);
    }

    #[test]
    fn parse_flags() {
        let args = parse_args(&argv(&[
            "--scenario",
            "banner",
            "--width-px",
            "720",
            "--density",
            "2",
            "--no-fill",
        ]))
        .unwrap();
        assert_eq!(args.scenario, Scenario::Banner);
        assert_eq!(args.display.logical_width(), Some(360));
        assert!(args.no_fill);
    }

    #[test]
    fn parse_errors() {
        assert!(parse_args(&argv(&["--scenario", "video"])).is_err());
        assert!(parse_args(&argv(&["--width-px"])).is_err());
        assert!(parse_args(&argv(&["--bogus"])).is_err());
    }

    #[tokio::test]
    async fn scenarios_run_against_simulated_backend() {
        let args = parse_args(&argv(&["--no-fill"])).unwrap();
        let backend = Arc::new(SimulatedBackend::new().with_auto_dismiss(Duration::from_millis(10)));

        run_banner(&backend, &args).await.unwrap();
        run_preload(&backend).await.unwrap();
        run_app_open(&backend).await.unwrap();

        // Two banner loads plus at least one preload per pool.
        assert!(backend.load_calls() >= 4);
    }
}
