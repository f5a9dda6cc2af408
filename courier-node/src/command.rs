//! Interactive command line: one line in, one `Command` out.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use courier_core::{DeliveryMode, Rank};

pub const HELP: &str = "\
commands:
  <text>                               broadcast to everyone
  /dm <rank> <text> [--mode p2p]       direct message
  /send <path> <rank> [--mode p2p]     offer a file
  /accept <rank>                       accept the pending offer from <rank>
  /deny <rank>                         deny the pending offer from <rank>
  /users                               who is online
  /shutdown                            stop the router
  /help                                this list
  /quit                                log out and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Dm {
        rank: Rank,
        text: String,
        mode: DeliveryMode,
    },
    Send {
        path: PathBuf,
        rank: Rank,
        mode: DeliveryMode,
    },
    Accept(Rank),
    Deny(Rank),
    Users,
    Shutdown,
    Help,
    Quit,
}

/// Parse one input line. Blank lines are `Ok(None)`.
pub fn parse(line: &str) -> anyhow::Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Broadcast(line.to_string())));
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let cmd = match verb {
        "/quit" | "/exit" => Command::Quit,
        "/users" => Command::Users,
        "/help" => Command::Help,
        "/shutdown" => Command::Shutdown,
        "/accept" => Command::Accept(parse_rank(rest)?),
        "/deny" => Command::Deny(parse_rank(rest)?),
        "/dm" => {
            let (body, mode) = split_mode(rest)?;
            let (rank, text) = body
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: /dm <rank> <text> [--mode p2p]"))?;
            let text = text.trim();
            if text.is_empty() {
                bail!("usage: /dm <rank> <text> [--mode p2p]");
            }
            Command::Dm {
                rank: parse_rank(rank)?,
                text: text.to_string(),
                mode,
            }
        }
        "/send" => {
            let (body, mode) = split_mode(rest)?;
            let (path, rank) = body
                .rsplit_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: /send <path> <rank> [--mode p2p]"))?;
            let path = path.trim();
            if path.is_empty() {
                bail!("usage: /send <path> <rank> [--mode p2p]");
            }
            Command::Send {
                path: PathBuf::from(path),
                rank: parse_rank(rank)?,
                mode,
            }
        }
        other => bail!("unknown command {} (try /help)", other),
    };
    Ok(Some(cmd))
}

fn parse_rank(s: &str) -> anyhow::Result<Rank> {
    let s = s.trim();
    if s.is_empty() {
        bail!("missing rank");
    }
    s.parse::<Rank>()
        .with_context(|| format!("{:?} is not a rank", s))
}

/// Strip a trailing `--mode <relay|p2p>`. Relay when absent.
fn split_mode(rest: &str) -> anyhow::Result<(&str, DeliveryMode)> {
    let rest = rest.trim_end();
    match rest.rsplit_once("--mode") {
        Some((head, value))
            if (head.is_empty() || head.ends_with(char::is_whitespace))
                && !value.trim().contains(char::is_whitespace) =>
        {
            let value = value.trim();
            if value.is_empty() {
                bail!("--mode needs a value (relay or p2p)");
            }
            let mode = value
                .parse::<DeliveryMode>()
                .map_err(|_| anyhow!("unknown mode {:?} (relay or p2p)", value))?;
            Ok((head.trim_end(), mode))
        }
        _ => Ok((rest, DeliveryMode::Relay)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(line: &str) -> Command {
        parse(line).unwrap().unwrap()
    }

    #[test]
    fn plain_text_is_broadcast() {
        assert_eq!(cmd("  hello all "), Command::Broadcast("hello all".into()));
        assert!(parse("   ").unwrap().is_none());
    }

    #[test]
    fn dm_keeps_text_and_mode() {
        assert_eq!(
            cmd("/dm 3 see you at 5"),
            Command::Dm {
                rank: 3,
                text: "see you at 5".into(),
                mode: DeliveryMode::Relay,
            }
        );
        assert_eq!(
            cmd("/dm 3 psst --mode P2P"),
            Command::Dm {
                rank: 3,
                text: "psst".into(),
                mode: DeliveryMode::P2p,
            }
        );
        assert!(parse("/dm 3").is_err());
        assert!(parse("/dm x hi").is_err());
    }

    #[test]
    fn send_takes_rank_from_the_end() {
        assert_eq!(
            cmd("/send my photos/photo.png 3 --mode p2p"),
            Command::Send {
                path: PathBuf::from("my photos/photo.png"),
                rank: 3,
                mode: DeliveryMode::P2p,
            }
        );
        assert!(parse("/send photo.png").is_err());
        assert!(parse("/send photo.png 3 --mode carrier-pigeon").is_err());
    }

    #[test]
    fn simple_verbs() {
        assert_eq!(cmd("/accept 2"), Command::Accept(2));
        assert_eq!(cmd("/deny 2"), Command::Deny(2));
        assert_eq!(cmd("/users"), Command::Users);
        assert_eq!(cmd("/help"), Command::Help);
        assert_eq!(cmd("/shutdown"), Command::Shutdown);
        assert_eq!(cmd("/quit"), Command::Quit);
        assert!(parse("/accept").is_err());
        assert!(parse("/frobnicate").is_err());
    }
}
