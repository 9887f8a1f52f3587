//! Admin command parsing.
//!
//! Commands arrive as an argument list, either from a RESP array or from
//! an inline text line split on ASCII whitespace (see `parse.rs`). Command
//! and subcommand names are case-insensitive.
//! Node ids stay as raw strings here; resolving them against the cluster
//! config is the coordinator's job, so an unparsable id reports the same
//! "unknown node" error as a well-formed id nobody has heard of.

use thiserror::Error;

/// Errors produced while turning a line into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("unknown subcommand '{0}'. Try CLUSTER HELP.")]
    UnknownSubcommand(String),

    #[error("Invalid or out of range slot {0}")]
    InvalidSlot(String),

    #[error("value is not an integer or out of range: '{0}'")]
    InvalidInteger(String),
}

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// PING [message].
    Ping(Option<String>),

    /// CLUSTER <subcommand> ...
    Cluster(ClusterCommand),
}

/// CLUSTER subcommands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCommand {
    MyId,
    Nodes,
    Info,
    Slots,

    /// MEET <id> <host> <port>. Adds a primary with a known endpoint.
    Meet { id: String, host: String, port: u16 },

    /// FORGET <id> [ban-seconds].
    Forget { id: String, ban_secs: Option<u64> },

    AddSlots(Vec<u16>),
    DelSlots(Vec<u16>),

    SetSlot { slot: u16, action: SetSlotAction },

    /// BUMPEPOCH [id]. Defaults to the local node.
    BumpEpoch(Option<String>),

    /// REPLICATE <primary-id>. Makes the local node a replica.
    Replicate(String),

    /// FAILOVER <replica-id>. Promotes the replica.
    Failover(String),

    KeySlot(String),

    /// ROLE <id>. Role of any node, `unassigned` for unknown ids.
    Role(String),
}

/// Second half of CLUSTER SETSLOT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSlotAction {
    Node(String),
    Migrating(String),
    Importing(String),
    /// Drop the migration state, keeping the owner.
    Stable,
    /// Finish the migration or import in flight.
    Complete,
}

impl Command {
    /// Parses one inline command line.
    #[cfg(test)]
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        let args: Vec<&str> = line.split_ascii_whitespace().collect();
        Self::from_args(&args)
    }

    /// Parses a command from its arguments, name first.
    pub fn from_args(args: &[&str]) -> Result<Command, CommandError> {
        let Some((name, rest)) = args.split_first() else {
            return Err(CommandError::Empty);
        };

        match name.to_ascii_uppercase().as_str() {
            "PING" => parse_ping(rest),
            "CLUSTER" => parse_cluster(rest).map(Command::Cluster),
            _ => Err(CommandError::UnknownCommand(name.to_string())),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping(_) => "ping",
            Command::Cluster(sub) => sub.name(),
        }
    }
}

impl ClusterCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterCommand::MyId => "cluster myid",
            ClusterCommand::Nodes => "cluster nodes",
            ClusterCommand::Info => "cluster info",
            ClusterCommand::Slots => "cluster slots",
            ClusterCommand::Meet { .. } => "cluster meet",
            ClusterCommand::Forget { .. } => "cluster forget",
            ClusterCommand::AddSlots(_) => "cluster addslots",
            ClusterCommand::DelSlots(_) => "cluster delslots",
            ClusterCommand::SetSlot { .. } => "cluster setslot",
            ClusterCommand::BumpEpoch(_) => "cluster bumpepoch",
            ClusterCommand::Replicate(_) => "cluster replicate",
            ClusterCommand::Failover(_) => "cluster failover",
            ClusterCommand::KeySlot(_) => "cluster keyslot",
            ClusterCommand::Role(_) => "cluster role",
        }
    }
}

fn parse_ping(args: &[&str]) -> Result<Command, CommandError> {
    match args {
        [] => Ok(Command::Ping(None)),
        [msg] => Ok(Command::Ping(Some(msg.to_string()))),
        _ => Err(CommandError::WrongArity("PING".into())),
    }
}

fn parse_cluster(args: &[&str]) -> Result<ClusterCommand, CommandError> {
    let Some((sub, rest)) = args.split_first() else {
        return Err(CommandError::WrongArity("CLUSTER".into()));
    };
    let sub_upper = sub.to_ascii_uppercase();
    let arity = || CommandError::WrongArity(format!("CLUSTER {sub_upper}"));

    match sub_upper.as_str() {
        "MYID" | "NODES" | "INFO" | "SLOTS" => {
            if !rest.is_empty() {
                return Err(arity());
            }
            Ok(match sub_upper.as_str() {
                "MYID" => ClusterCommand::MyId,
                "NODES" => ClusterCommand::Nodes,
                "INFO" => ClusterCommand::Info,
                _ => ClusterCommand::Slots,
            })
        }
        "MEET" => match rest {
            [id, host, port] => Ok(ClusterCommand::Meet {
                id: id.to_string(),
                host: host.to_string(),
                port: parse_int(port)?,
            }),
            _ => Err(arity()),
        },
        "FORGET" => match rest {
            [id] => Ok(ClusterCommand::Forget {
                id: id.to_string(),
                ban_secs: None,
            }),
            [id, ban] => Ok(ClusterCommand::Forget {
                id: id.to_string(),
                ban_secs: Some(parse_int(ban)?),
            }),
            _ => Err(arity()),
        },
        "ADDSLOTS" | "DELSLOTS" => {
            if rest.is_empty() {
                return Err(arity());
            }
            let slots = rest
                .iter()
                .map(|s| parse_slot(s))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if sub_upper == "ADDSLOTS" {
                ClusterCommand::AddSlots(slots)
            } else {
                ClusterCommand::DelSlots(slots)
            })
        }
        "SETSLOT" => parse_setslot(rest).ok_or_else(arity)?,
        "BUMPEPOCH" => match rest {
            [] => Ok(ClusterCommand::BumpEpoch(None)),
            [id] => Ok(ClusterCommand::BumpEpoch(Some(id.to_string()))),
            _ => Err(arity()),
        },
        "REPLICATE" => single(rest).map(ClusterCommand::Replicate).ok_or_else(arity),
        "FAILOVER" => single(rest).map(ClusterCommand::Failover).ok_or_else(arity),
        "KEYSLOT" => single(rest).map(ClusterCommand::KeySlot).ok_or_else(arity),
        "ROLE" => single(rest).map(ClusterCommand::Role).ok_or_else(arity),
        _ => Err(CommandError::UnknownSubcommand(sub.to_string())),
    }
}

/// Returns `None` on an arity mismatch so the caller can name the command.
fn parse_setslot(args: &[&str]) -> Option<Result<ClusterCommand, CommandError>> {
    let (slot, action) = match args {
        [slot, action] => {
            let action = match action.to_ascii_uppercase().as_str() {
                "STABLE" => SetSlotAction::Stable,
                "COMPLETE" => SetSlotAction::Complete,
                "NODE" | "MIGRATING" | "IMPORTING" => return None,
                _ => return Some(Err(CommandError::UnknownSubcommand(action.to_string()))),
            };
            (slot, action)
        }
        [slot, action, id] => {
            let id = id.to_string();
            let action = match action.to_ascii_uppercase().as_str() {
                "NODE" => SetSlotAction::Node(id),
                "MIGRATING" => SetSlotAction::Migrating(id),
                "IMPORTING" => SetSlotAction::Importing(id),
                _ => return Some(Err(CommandError::UnknownSubcommand(action.to_string()))),
            };
            (slot, action)
        }
        _ => return None,
    };
    Some(parse_slot(slot).map(|slot| ClusterCommand::SetSlot { slot, action }))
}

fn single(args: &[&str]) -> Option<String> {
    match args {
        [arg] => Some(arg.to_string()),
        _ => None,
    }
}

fn parse_int<T: std::str::FromStr>(s: &str) -> Result<T, CommandError> {
    s.parse()
        .map_err(|_| CommandError::InvalidInteger(s.to_string()))
}

/// Range against the actual slot count is checked by the config.
fn parse_slot(s: &str) -> Result<u16, CommandError> {
    s.parse()
        .map_err(|_| CommandError::InvalidSlot(s.to_string()))
}
