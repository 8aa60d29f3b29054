use std::{error::Error, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use rtmac::{config::StationAddr, scheduler::WaitKind};
use rtmac_linux::{
    config::{Config, DEFAULT_CONFIG_PATH},
    control::{send_request, ControlRequest, ControlResponse},
};

const DEFAULT_CONTROL_PATH: &str = "/run/rtmac/control";

#[derive(Parser)]
#[clap(version, about = "Query and control the rtmac daemon")]
#[clap(arg_required_else_help(true))]
struct Cli {
    /// Path of the control socket. Defaults to the one in the configuration
    /// file, or /run/rtmac/control.
    #[clap(long, short = 's')]
    socket: Option<PathBuf>,

    /// Configuration file to read the control socket path from
    #[clap(long = "config", short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    config_file: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Rt,
    Nrt,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Wait {
    /// Once per cycle
    Cycle,
    /// At the transmit slots of the station
    Xmit,
}

#[derive(Subcommand)]
enum Command {
    #[clap(about = "Take the master role")]
    BecomeMaster {
        /// Cycle period in microseconds, defaults to the configured one
        #[clap(long)]
        cycle_period_us: Option<u64>,
    },
    #[clap(about = "Take the client role and wait to be admitted")]
    BecomeClient,
    #[clap(about = "Start cycling as master")]
    Up,
    #[clap(about = "Stop all TDMA activity")]
    Down,
    #[clap(about = "Admit a station to the cycle")]
    AddStation {
        address: StationAddr,
        #[clap(value_enum)]
        kind: Kind,
        /// Slot offset in microseconds, only used for RT stations
        #[clap(long, default_value_t = 0)]
        offset_us: u64,
    },
    #[clap(about = "Remove a station from the cycle")]
    RemoveStation {
        address: StationAddr,
        #[clap(value_enum)]
        kind: Kind,
    },
    #[clap(about = "Change the cycle period")]
    ChangeCycle { cycle_period_us: u64 },
    #[clap(about = "Move a station to another slot")]
    ChangeOffset { address: StationAddr, offset_us: u64 },
    #[clap(about = "Change the non-real-time payload limit")]
    ChangeMtu { mtu: u16 },
    #[clap(about = "Show the offset to the master clock in nanoseconds")]
    TimeOffset,
    #[clap(about = "Wait for the next cycle or transmit slot")]
    Wait {
        #[clap(value_enum, default_value_t = Wait::Cycle)]
        kind: Wait,
    },
    #[clap(about = "Show the state of the TDMA instance")]
    Status,
}

impl Command {
    fn into_request(self) -> ControlRequest {
        match self {
            Command::BecomeMaster { cycle_period_us } => {
                ControlRequest::BecomeMaster { cycle_period_us }
            }
            Command::BecomeClient => ControlRequest::BecomeClient,
            Command::Up => ControlRequest::Up,
            Command::Down => ControlRequest::Down,
            Command::AddStation {
                address,
                kind,
                offset_us,
            } => ControlRequest::AddStation {
                address,
                rt: matches!(kind, Kind::Rt),
                offset_us,
            },
            Command::RemoveStation { address, kind } => ControlRequest::RemoveStation {
                address,
                rt: matches!(kind, Kind::Rt),
            },
            Command::ChangeCycle { cycle_period_us } => {
                ControlRequest::ChangeCycle { cycle_period_us }
            }
            Command::ChangeOffset { address, offset_us } => {
                ControlRequest::ChangeOffset { address, offset_us }
            }
            Command::ChangeMtu { mtu } => ControlRequest::ChangeMtu { mtu },
            Command::TimeOffset => ControlRequest::TimeOffset,
            Command::Wait { kind } => ControlRequest::WaitOnCycle {
                kind: match kind {
                    Wait::Cycle => WaitKind::Default,
                    Wait::Xmit => WaitKind::Xmit,
                },
            },
            Command::Status => ControlRequest::Snapshot,
        }
    }
}

async fn control_path(cli: &Cli) -> PathBuf {
    if let Some(socket) = &cli.socket {
        return socket.clone();
    }

    match Config::from_file(&cli.config_file).await {
        Ok(config) => config
            .observability
            .control_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_PATH)),
        Err(_) => PathBuf::from(DEFAULT_CONTROL_PATH),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let path = control_path(&cli).await;
    let request = cli.command.into_request();

    let response = send_request(&path, &request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    let exit_code = match response {
        ControlResponse::Rejected { .. } | ControlResponse::Failed { .. } => 1,
        _ => 0,
    };

    std::process::exit(exit_code);
}
