use bytes::Bytes;
use thiserror::Error;

/// Recoverable command-layer failures. Neither closes the connection: an
/// unknown command elicits no reply at all, an arity violation a null bulk.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("wrong number of arguments for '{0}'")]
    Arity(&'static str),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RedisCommand {
    Ping,
    Echo {
        message: Bytes,
    },
    Get {
        key: Bytes,
    },
    Set {
        key: Bytes,
        value: Bytes,
        expiry_ms: Option<u64>,
    },
    Keys {
        pattern: Bytes,
    },
    ConfigGet {
        name: Bytes,
    },
    Info {
        section: Option<Bytes>,
    },
    ReplConf,
    PSync,
}

impl RedisCommand {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Set { .. })
    }

    /// Parses a decoded command vector. The command name is folded to ASCII
    /// lowercase; option tokens compare case-insensitively.
    pub fn parse(parts: &[Bytes]) -> Result<Self, CommandError> {
        let Some((name, args)) = parts.split_first() else {
            return Err(CommandError::Unknown(String::new()));
        };

        match name.to_ascii_lowercase().as_slice() {
            b"ping" | b"command" => Ok(Self::Ping),
            b"echo" => match args {
                [message] => Ok(Self::Echo {
                    message: message.clone(),
                }),
                _ => Err(CommandError::Arity("echo")),
            },
            b"get" => match args {
                [key] => Ok(Self::Get { key: key.clone() }),
                _ => Err(CommandError::Arity("get")),
            },
            b"set" => match args {
                [key, value] => Ok(Self::Set {
                    key: key.clone(),
                    value: value.clone(),
                    expiry_ms: None,
                }),
                [key, value, option, millis] => Ok(Self::Set {
                    key: key.clone(),
                    value: value.clone(),
                    expiry_ms: parse_px(option, millis),
                }),
                _ => Err(CommandError::Arity("set")),
            },
            b"keys" => match args {
                [pattern] => Ok(Self::Keys {
                    pattern: pattern.clone(),
                }),
                _ => Err(CommandError::Arity("keys")),
            },
            b"config" => match args {
                [sub, name] if sub.eq_ignore_ascii_case(b"get") => Ok(Self::ConfigGet {
                    name: name.clone(),
                }),
                [sub, ..] if !sub.eq_ignore_ascii_case(b"get") => Err(CommandError::Unknown(
                    format!("config {}", String::from_utf8_lossy(sub)),
                )),
                _ => Err(CommandError::Arity("config get")),
            },
            b"info" => Ok(Self::Info {
                section: args.first().cloned(),
            }),
            b"replconf" => match args {
                [_, _] => Ok(Self::ReplConf),
                _ => Err(CommandError::Arity("replconf")),
            },
            b"psync" => match args {
                [_, _] => Ok(Self::PSync),
                _ => Err(CommandError::Arity("psync")),
            },
            _ => Err(CommandError::Unknown(
                String::from_utf8_lossy(name).into_owned(),
            )),
        }
    }
}

/// `PX` numeric parsing is best-effort: an unrecognized option token or an
/// unparsable count drops the expiry, and the write still succeeds.
fn parse_px(option: &Bytes, millis: &Bytes) -> Option<u64> {
    if !option.eq_ignore_ascii_case(b"px") {
        return None;
    }

    std::str::from_utf8(millis).ok()?.parse().ok()
}
