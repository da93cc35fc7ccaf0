use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use control_core::{
    available_ports, CommandDispatcher, DefaultTransportFactory, DispatcherOptions,
    PlaybackOutcome, SendOutcome, SequenceBuilder, SequencePlayer, SequenceRun,
};
use shared::{
    config::ServoConfig,
    domain::{
        is_builtin_name, Angles, ConnectionMode, GripperAction, Position, DEFAULT_STEP_DELAY_MS,
        SERVO_COUNT,
    },
    protocol::ControllerReply,
};
use storage::{ConfigStore, PositionStore, RoutineStore};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod console;
mod settings;

use console::{ConsoleConnectionListener, ConsoleLog, StdinConfirm};
use settings::{load_settings, load_settings_from, Settings};

/// How long to wait for the controller banner after opening a serial port.
/// Most boards reset when the port opens.
const READY_TIMEOUT: Duration = Duration::from_millis(2500);
/// Time left for controller replies before the link is closed.
const REPLY_LINGER: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(name = "armctl", about = "Drive a six-servo arm over serial or MQTT")]
struct Cli {
    /// Settings file to use instead of ./armctl.toml
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Directory holding posiciones.json, rutinas.json and config.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Serial port name, e.g. COM3 or /dev/ttyUSB0
    #[arg(long, global = true)]
    port: Option<String>,
    #[arg(long, global = true, value_enum)]
    mode: Option<ModeArg>,
    /// Answer yes to confirmation prompts
    #[arg(long, short = 'y', global = true)]
    yes: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Serial,
    Mqtt,
}

impl From<ModeArg> for ConnectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Serial => ConnectionMode::Serial,
            ModeArg::Mqtt => ConnectionMode::Mqtt,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GripperArg {
    Open,
    Close,
}

impl From<GripperArg> for GripperAction {
    fn from(action: GripperArg) -> Self {
        match action {
            GripperArg::Open => GripperAction::Open,
            GripperArg::Close => GripperAction::Close,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports on this machine
    Ports,
    /// Move one servo (1-6)
    Servo { servo: u8, angle: i32 },
    /// Move all servos at once: a1,a2,a3,a4,a5,a6
    Move {
        #[arg(value_parser = parse_angles)]
        angles: Angles,
    },
    /// Interpolated move over DURATION_MS
    Smooth {
        #[arg(value_parser = parse_angles)]
        angles: Angles,
        duration_ms: u64,
    },
    /// Go to a built-in or saved position
    Preset { name: String },
    Gripper {
        #[arg(value_enum)]
        action: GripperArg,
    },
    #[command(subcommand)]
    Positions(PositionsCommand),
    #[command(subcommand)]
    Routines(RoutinesCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum PositionsCommand {
    List,
    Save {
        name: String,
        #[arg(value_parser = parse_angles)]
        angles: Angles,
    },
    Delete {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum RoutinesCommand {
    List,
    Show {
        name: String,
    },
    /// Save a routine made of library positions, in order
    Save {
        name: String,
        #[arg(required = true)]
        steps: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_STEP_DELAY_MS)]
        delay_ms: u64,
    },
    Delete {
        name: String,
    },
    /// Play a saved routine; Ctrl-C stops it
    Play {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Args, Debug)]
struct ConfigSetArgs {
    #[arg(long)]
    mqtt_address: Option<String>,
    #[arg(long)]
    mqtt_topic: Option<String>,
    #[arg(long)]
    baud_rate: Option<u32>,
    /// Servo range as SERVO=MIN:MAX, e.g. 6=30:180. Repeatable.
    #[arg(long = "range", value_parser = parse_range)]
    ranges: Vec<ServoRange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ServoRange {
    servo: usize,
    min: i32,
    max: i32,
}

fn parse_angles(raw: &str) -> Result<Angles, String> {
    let values: Vec<&str> = raw.split(',').map(str::trim).collect();
    if values.len() != SERVO_COUNT {
        return Err(format!("expected {SERVO_COUNT} comma-separated angles"));
    }
    let mut angles = [0; SERVO_COUNT];
    for (slot, value) in angles.iter_mut().zip(values) {
        *slot = value
            .parse()
            .map_err(|_| format!("'{value}' is not a whole number"))?;
    }
    Ok(angles)
}

fn parse_range(raw: &str) -> Result<ServoRange, String> {
    let invalid = || format!("'{raw}' is not SERVO=MIN:MAX");
    let (servo, range) = raw.split_once('=').ok_or_else(invalid)?;
    let (min, max) = range.split_once(':').ok_or_else(invalid)?;
    let servo: usize = servo.trim().parse().map_err(|_| invalid())?;
    if !(1..=SERVO_COUNT).contains(&servo) {
        return Err(format!("servo {servo} is out of range (expected 1-{SERVO_COUNT})"));
    }
    Ok(ServoRange {
        servo,
        min: min.trim().parse().map_err(|_| invalid())?,
        max: max.trim().parse().map_err(|_| invalid())?,
    })
}

fn format_angles(angles: &Angles) -> String {
    angles
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

struct App {
    settings: Settings,
    confirm: StdinConfirm,
}

impl App {
    fn positions(&self) -> PositionStore {
        PositionStore::open(self.settings.positions_path())
    }

    fn routines(&self) -> RoutineStore {
        RoutineStore::open(self.settings.routines_path())
    }

    fn config_store(&self) -> ConfigStore {
        ConfigStore::open(self.settings.config_path())
    }

    async fn connect(&self) -> Result<Arc<CommandDispatcher>> {
        let mode = self.settings.mode;
        let dispatcher = CommandDispatcher::new_with_dependencies(
            Arc::new(DefaultTransportFactory),
            Arc::new(ConsoleLog),
            Arc::new(ConsoleConnectionListener),
            DispatcherOptions {
                mode,
                config: self.config_store().load_or_default(),
                send_timeout: self.settings.send_timeout,
            },
        );
        let mut replies = dispatcher.subscribe_replies();
        let params = dispatcher
            .connect_params(self.settings.serial_port.as_deref())
            .await?;
        dispatcher.connect(params).await?;
        if mode == ConnectionMode::Serial {
            wait_for_ready(&mut replies).await;
        }
        Ok(dispatcher)
    }

    async fn with_connection<F, Fut>(&self, action: F) -> Result<()>
    where
        F: FnOnce(Arc<CommandDispatcher>) -> Fut,
        Fut: std::future::Future<Output = Result<SendOutcome, shared::error::ReportedError>>,
    {
        let dispatcher = self.connect().await?;
        let result = action(Arc::clone(&dispatcher)).await;
        tokio::time::sleep(REPLY_LINGER).await;
        dispatcher.disconnect().await;
        if result? == SendOutcome::NotConnected {
            warn!("link dropped before the command was sent");
        }
        Ok(())
    }
}

async fn wait_for_ready(replies: &mut broadcast::Receiver<ControllerReply>) {
    let ready = tokio::time::timeout(READY_TIMEOUT, async {
        loop {
            match replies.recv().await {
                Ok(ControllerReply::Ready) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
            }
        }
    })
    .await;
    if ready.is_err() {
        debug!("controller did not announce itself; sending anyway");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.settings {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }
    if let Some(port) = cli.port {
        settings.serial_port = Some(port);
    }
    if let Some(mode) = cli.mode {
        settings.mode = mode.into();
    }
    debug!(?settings, "settings resolved");

    let app = App {
        settings,
        confirm: StdinConfirm {
            assume_yes: cli.yes,
        },
    };
    run(&app, cli.command).await
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Ports => {
            let ports = available_ports()?;
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for port in ports {
                println!("{port}");
            }
        }
        Command::Servo { servo, angle } => {
            app.with_connection(|d| async move { d.move_servo(servo, angle).await })
                .await?;
        }
        Command::Move { angles } => {
            app.with_connection(|d| async move { d.move_all(angles, "MOVE").await })
                .await?;
        }
        Command::Smooth {
            angles,
            duration_ms,
        } => {
            app.with_connection(|d| async move { d.smooth_move(angles, duration_ms).await })
                .await?;
        }
        Command::Preset { name } => {
            let Some(position) = app.positions().find(&name)? else {
                bail!("no position named '{name}'");
            };
            app.with_connection(|d| async move { d.go_to(&position).await })
                .await?;
        }
        Command::Gripper { action } => {
            app.with_connection(|d| async move { d.gripper(action.into()).await })
                .await?;
        }
        Command::Positions(command) => run_positions(app, command)?,
        Command::Routines(command) => run_routines(app, command).await?,
        Command::Config(command) => run_config(app, command)?,
    }
    Ok(())
}

fn run_positions(app: &App, command: PositionsCommand) -> Result<()> {
    let mut store = app.positions();
    match command {
        PositionsCommand::List => {
            for position in store.load_all()? {
                let marker = if is_builtin_name(&position.name) {
                    " (built-in)"
                } else {
                    ""
                };
                println!(
                    "{:<16} [{}]{marker}",
                    position.display_name(),
                    format_angles(&position.angles)
                );
            }
        }
        PositionsCommand::Save { name, angles } => {
            let name = name.trim().to_string();
            store.save(Position::new(name.clone(), angles))?;
            println!("saved position '{name}'");
        }
        PositionsCommand::Delete { name } => match store.delete_confirmed(&name, &app.confirm)? {
            Some(removed) => println!("deleted position '{}'", removed.name),
            None => println!("kept position '{name}'"),
        },
    }
    Ok(())
}

async fn run_routines(app: &App, command: RoutinesCommand) -> Result<()> {
    let mut store = app.routines();
    match command {
        RoutinesCommand::List => {
            for routine in store.load_all()? {
                println!(
                    "{:<16} {} steps, {} ms between steps",
                    routine.name,
                    routine.steps.len(),
                    routine.step_delay_ms
                );
            }
        }
        RoutinesCommand::Show { name } => {
            let Some(routine) = store.find(&name)? else {
                bail!("no routine named '{name}'");
            };
            println!("{} ({} ms between steps)", routine.name, routine.step_delay_ms);
            for (index, step) in routine.steps.iter().enumerate() {
                println!(
                    "{:>3}. {:<16} [{}]",
                    index + 1,
                    step.display_name(),
                    format_angles(&step.angles)
                );
            }
        }
        RoutinesCommand::Save {
            name,
            steps,
            delay_ms,
        } => {
            let mut positions = app.positions();
            let mut builder = SequenceBuilder::new();
            builder.set_step_delay_ms(delay_ms);
            for step in &steps {
                let position = positions
                    .find(step)?
                    .with_context(|| format!("no position named '{step}'"))?;
                builder.push(position);
            }
            let routine = builder.to_routine(&name)?;
            let count = routine.steps.len();
            store.save(routine)?;
            println!("saved routine '{}' with {count} steps", name.trim());
        }
        RoutinesCommand::Delete { name } => match store.delete_confirmed(&name, &app.confirm)? {
            Some(removed) => println!("deleted routine '{}'", removed.name),
            None => println!("kept routine '{name}'"),
        },
        RoutinesCommand::Play { name } => {
            let Some(routine) = store.find(&name)? else {
                bail!("no routine named '{name}'");
            };
            play_routine(app, SequenceRun::from(&routine)).await?;
        }
    }
    Ok(())
}

async fn play_routine(app: &App, run: SequenceRun) -> Result<()> {
    let dispatcher = app.connect().await?;
    let player = SequencePlayer::new(Arc::clone(&dispatcher));
    let handle = player.play(run)?;

    let canceller = Arc::clone(&player);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stopping sequence");
            canceller.cancel();
        }
    });
    let report = handle.wait().await;
    ctrl_c.abort();
    dispatcher.disconnect().await;

    match report.outcome {
        PlaybackOutcome::Completed => {
            println!("'{}' completed: {} steps", report.name, report.steps_reached)
        }
        PlaybackOutcome::Cancelled => println!(
            "'{}' stopped after {} of {} steps",
            report.name, report.steps_reached, report.total_steps
        ),
        PlaybackOutcome::Failed(err) => return Err(err.into()),
    }
    Ok(())
}

fn run_config(app: &App, command: ConfigCommand) -> Result<()> {
    let store = app.config_store();
    match command {
        ConfigCommand::Show => {
            let config = store.load_or_default();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommand::Set(args) => {
            let config = apply_config_args(store.load_or_default(), args);
            store
                .save(&config)
                .with_context(|| format!("configuration not saved to {}", store.path().display()))?;
            println!("saved {}", store.path().display());
        }
    }
    Ok(())
}

fn apply_config_args(mut config: ServoConfig, args: ConfigSetArgs) -> ServoConfig {
    if let Some(address) = args.mqtt_address {
        config.mqtt_address = address;
    }
    if let Some(topic) = args.mqtt_topic {
        config.mqtt_topic = topic;
    }
    if let Some(baud_rate) = args.baud_rate {
        config.baud_rate = baud_rate;
    }
    for range in args.ranges {
        config.min_angles[range.servo - 1] = range.min;
        config.max_angles[range.servo - 1] = range.max;
    }
    config
}
