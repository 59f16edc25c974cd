use std::sync::Arc;

use serde::Serialize;
use sinc_session::{
    CancelSignal, ConnectionState, ControllerOptions, LayerState, MacroKeyState, PollingTask,
    RequestMode, SessionEvent, SincController, StateChange, TargetLayer, KEYBOARD_FILTER,
};
use sinc_storage::Settings;
use tokio::sync::broadcast;
use tracing::{info, warn};
use transport_hid::{DeviceProvider, HidProvider, WatcherHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match cmd {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "status" => cmd_status(&args),
        "layer" => cmd_layer(&args),
        "macro-key" => cmd_macro_key(&args),
        "watch" => cmd_watch().await,
        "config" => cmd_config(&args),
        other => anyhow::bail!("unknown command: {other} (run `sinc help`)"),
    }
}

fn print_help() {
    eprintln!(
        r#"sinc keyboard control

USAGE:
  sinc status [--json]
  sinc layer <windows|mac>
  sinc macro-key <enable|disable>
  sinc watch
  sinc config <show|path|init [--force]>
"#
    );
}

fn connect(settings: &Settings) -> anyhow::Result<SincController> {
    let provider: Arc<dyn DeviceProvider> = Arc::new(HidProvider::new(settings.read_slice())?);
    let controller = SincController::new(provider, controller_options(settings));
    controller.open()?;
    Ok(controller)
}

fn controller_options(settings: &Settings) -> ControllerOptions {
    ControllerOptions {
        response_timeout: settings.response_timeout(),
    }
}

#[derive(Serialize)]
struct StatusReport {
    connected: bool,
    layer: Option<LayerState>,
    macro_key: MacroKeyState,
}

fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let json = match args.get(2).map(|s| s.as_str()) {
        None => false,
        Some("--json") => true,
        Some(other) => anyhow::bail!("unknown flag for status: {other}"),
    };

    let settings = sinc_storage::load_settings()?;
    let controller = connect(&settings)?;
    if !controller.query_layer_status(RequestMode::OneShot)? {
        anyhow::bail!("keyboard disconnected before the layer query was sent");
    }

    let state = controller.state();
    controller.close();

    let report = StatusReport {
        connected: state.connected(),
        layer: state.layer(),
        macro_key: state.macro_key(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let layer = report
            .layer
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("layer:     {layer}");
        println!("macro key: {}", report.macro_key);
    }
    Ok(())
}

fn cmd_layer(args: &[String]) -> anyhow::Result<()> {
    let target: TargetLayer = args
        .get(2)
        .ok_or_else(|| anyhow::anyhow!("missing layer (usage: sinc layer <windows|mac>)"))?
        .parse()?;

    let settings = sinc_storage::load_settings()?;
    let controller = connect(&settings)?;
    if !controller.request_layer(target, RequestMode::OneShot)? {
        anyhow::bail!("keyboard disconnected before the request was sent");
    }
    let layer = controller.state().layer();
    controller.close();

    match layer {
        Some(layer) => println!("layer: {layer}"),
        None => println!("layer request sent; keyboard did not confirm"),
    }
    Ok(())
}

fn cmd_macro_key(args: &[String]) -> anyhow::Result<()> {
    let wanted: MacroKeyState = args
        .get(2)
        .ok_or_else(|| anyhow::anyhow!("missing state (usage: sinc macro-key <enable|disable>)"))?
        .parse()?;

    let settings = sinc_storage::load_settings()?;
    let controller = connect(&settings)?;
    if !controller.set_macro_key(wanted, RequestMode::OneShot)? {
        anyhow::bail!("keyboard disconnected before the request was sent");
    }
    let state = controller.state().macro_key();
    controller.close();

    println!("macro key: {state}");
    Ok(())
}

async fn cmd_watch() -> anyhow::Result<()> {
    let settings = sinc_storage::load_settings()?;
    let provider: Arc<dyn DeviceProvider> = Arc::new(HidProvider::new(settings.read_slice())?);
    let controller = SincController::new(provider.clone(), controller_options(&settings));
    let mut events = controller.subscribe();

    let (watcher, mut hotplug) =
        transport_hid::spawn_watcher(provider, KEYBOARD_FILTER, settings.hotplug_interval())?;
    info!("waiting for keyboard (ctrl-c to exit)");

    let mut polling: Option<PollingTask> = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(err) = res {
                    warn!(%err, "failed to listen for ctrl-c");
                }
                break;
            }
            ev = hotplug.recv() => match ev {
                Some(ev) => {
                    // Opening the device enumerates and does blocking I/O.
                    let controller = controller.clone();
                    let handled =
                        tokio::task::spawn_blocking(move || controller.handle_hotplug(ev)).await;
                    if let Err(err) = handled {
                        warn!(%err, "hotplug handler failed");
                    }
                }
                None => {
                    warn!("hotplug watcher stopped");
                    break;
                }
            },
            ev = events.recv() => match ev {
                Ok(SessionEvent::DeviceConnected) => {
                    let (c, s) = (controller.clone(), settings.clone());
                    match tokio::task::spawn_blocking(move || on_connected(&c, &s)).await {
                        Ok(task) => polling = task,
                        Err(err) => warn!(%err, "connect handler failed"),
                    }
                }
                Ok(SessionEvent::DeviceDisconnected) => {
                    info!("keyboard disconnected");
                    // The controller already cancelled the loop; it exits on its own.
                    polling.take();
                }
                Ok(SessionEvent::Changed(change)) => log_change(change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "session event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let stopping =
        tokio::task::spawn_blocking(move || shutdown(&controller, &settings, polling, watcher));
    if let Err(err) = stopping.await {
        warn!(%err, "shutdown failed");
    }
    Ok(())
}

fn shutdown(
    controller: &SincController,
    settings: &Settings,
    polling: Option<PollingTask>,
    watcher: WatcherHandle,
) {
    if settings.restore_macro_key_on_exit
        && controller.connection_state() == ConnectionState::Connected
    {
        let mode = if controller.is_polling() {
            RequestMode::Polling
        } else {
            RequestMode::OneShot
        };
        if let Err(err) = controller.set_macro_key(MacroKeyState::Enabled, mode) {
            warn!(%err, "failed to re-enable macro key");
        }
    }

    if let Some(task) = polling {
        task.cancel();
        controller.close();
        task.join();
    } else {
        controller.close();
    }
    watcher.stop();
}

fn on_connected(controller: &SincController, settings: &Settings) -> Option<PollingTask> {
    info!("keyboard connected");
    let task = controller.start_polling(CancelSignal::new());
    if task.is_none() {
        warn!("could not start polling; state updates will be missed");
        return None;
    }

    if let Err(err) = controller.query_layer_status(RequestMode::Polling) {
        warn!(%err, "layer status query failed");
    }
    if settings.disable_macro_key_on_connect {
        if let Err(err) = controller.set_macro_key(MacroKeyState::Disabled, RequestMode::Polling) {
            warn!(%err, "failed to disable macro key");
        }
    }
    task
}

fn log_change(change: StateChange) {
    match change {
        StateChange::Layer { new: Some(layer), .. } => info!(%layer, "layer changed"),
        StateChange::Layer { new: None, .. } => info!("layer unknown"),
        StateChange::MacroKeyDisabled { new, .. } => info!(disabled = new, "macro key changed"),
        StateChange::Connected { new, .. } => info!(connected = new, "connection changed"),
    }
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let sub = args.get(2).map(|s| s.as_str()).unwrap_or("show");
    match sub {
        "show" => {
            let settings = sinc_storage::load_settings()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        "path" => {
            println!("{}", sinc_storage::paths::settings_path()?.display());
            Ok(())
        }
        "init" => {
            let force = match args.get(3).map(|s| s.as_str()) {
                None => false,
                Some("--force") => true,
                Some(other) => anyhow::bail!("unknown flag for config init: {other}"),
            };
            let path = sinc_storage::paths::settings_path()?;
            if path.exists() && !force {
                anyhow::bail!("{} already exists (pass --force to overwrite)", path.display());
            }
            sinc_storage::save_settings(&Settings::default())?;
            println!("wrote {}", path.display());
            Ok(())
        }
        other => anyhow::bail!("unknown config subcommand: {other} (run `sinc help`)"),
    }
}
