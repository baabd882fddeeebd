//! Command and reply types of the controller protocol

use std::fmt;
use std::path::PathBuf;
use std::str::{FromStr, SplitWhitespace};

use super::decoder::DecodeError;
use super::handles::Handle;
use super::types::{ColorSpace, FitMode, Rotation};

/// A parsed inbound command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Open a document. `wthack` suppresses the confirmation message.
    Open {
        wthack: bool,
        ack: i64,
        path: PathBuf,
    },
    ColorSpace(ColorSpace),
    FreePage(Handle),
    FreeTile(Handle),
    Geometry {
        width: u32,
        height: u32,
        fit: FitMode,
    },
    ReqLayout {
        rotation: Rotation,
        fit: FitMode,
        height: u32,
    },
    Page {
        page_no: usize,
        dim_index: usize,
    },
    Tile {
        page: Handle,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        staging: Option<Handle>,
    },
    SliceHeight(usize),
    Interrupt,
    TrimSet,
}

/// Errors on the controller link. Every one of them ends the worker.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("malformed {command} `{line}`: {detail}")]
    Malformed {
        command: &'static str,
        line: String,
        detail: String,
    },

    #[error("malformed reply `{0}`")]
    MalformedReply(String),

    #[error("zero-length frame")]
    EmptyFrame,

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("channel closed inside a frame")]
    Truncated,

    #[error("channel closed")]
    Closed,

    #[error("payload is not UTF-8")]
    NotUtf8,

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerFault {
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("decoder: {0}")]
    Decode(#[from] DecodeError),

    #[error("channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("stale or unknown {kind} handle {handle}")]
    StaleHandle { kind: &'static str, handle: Handle },

    #[error("dimension group {index} out of range ({count} groups)")]
    DimOutOfRange { index: usize, count: usize },

    #[error("{detail}")]
    Generic { detail: String },
}

impl WorkerFault {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic { detail: msg.into() }
    }
}

struct Args<'a> {
    command: &'static str,
    line: &'a str,
    tokens: SplitWhitespace<'a>,
}

impl<'a> Args<'a> {
    fn new(command: &'static str, line: &'a str, rest: &'a str) -> Self {
        Self {
            command,
            line,
            tokens: rest.split_whitespace(),
        }
    }

    fn malformed(&self, detail: impl Into<String>) -> ProtocolError {
        ProtocolError::Malformed {
            command: self.command,
            line: self.line.to_string(),
            detail: detail.into(),
        }
    }

    fn token(&mut self, what: &str) -> Result<&'a str, ProtocolError> {
        self.tokens
            .next()
            .ok_or_else(|| self.malformed(format!("missing {what}")))
    }

    fn number<T: FromStr>(&mut self, what: &str) -> Result<T, ProtocolError> {
        let token = self.token(what)?;
        token
            .parse()
            .map_err(|_| self.malformed(format!("bad {what} `{token}`")))
    }

    fn hex(&mut self, what: &str) -> Result<u64, ProtocolError> {
        let token = self.token(what)?;
        Handle::parse_hex(token).ok_or_else(|| self.malformed(format!("bad {what} `{token}`")))
    }

    fn handle(&mut self, what: &str) -> Result<Handle, ProtocolError> {
        let value = self.hex(what)?;
        Handle::from_wire(value).ok_or_else(|| self.malformed(format!("null {what}")))
    }

    fn fit(&mut self) -> Result<FitMode, ProtocolError> {
        let id: u32 = self.number("fit mode")?;
        FitMode::from_id(id).ok_or_else(|| self.malformed(format!("unknown fit mode {id}")))
    }
}

/// What follows the first `n` whitespace-separated tokens of `text`.
fn skip_tokens(text: &str, n: usize) -> &str {
    let mut rest = text.trim_start();
    for _ in 0..n {
        rest = rest
            .find(char::is_whitespace)
            .map_or("", |i| &rest[i..])
            .trim_start();
    }
    rest
}

impl Command {
    /// Parses one frame's payload.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim_start();
        let (keyword, rest) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));

        match keyword {
            "" => Err(ProtocolError::Empty),
            "open" => {
                let mut args = Args::new("open", line, rest);
                let wthack: i64 = args.number("wthack flag")?;
                let ack = args.number("ack id")?;
                // The path is everything after the two numbers, spaces included.
                let path = skip_tokens(rest, 2);
                if path.is_empty() {
                    return Err(args.malformed("missing path"));
                }
                Ok(Self::Open {
                    wthack: wthack != 0,
                    ack,
                    path: PathBuf::from(path),
                })
            }
            "cs" => {
                let mut args = Args::new("cs", line, rest);
                let id: u32 = args.number("colorspace")?;
                ColorSpace::from_id(id)
                    .map(Self::ColorSpace)
                    .ok_or_else(|| args.malformed(format!("unknown colorspace {id}")))
            }
            "freepage" => Ok(Self::FreePage(
                Args::new("freepage", line, rest).handle("page handle")?,
            )),
            "freetile" => Ok(Self::FreeTile(
                Args::new("freetile", line, rest).handle("tile handle")?,
            )),
            "geometry" => {
                let mut args = Args::new("geometry", line, rest);
                Ok(Self::Geometry {
                    width: args.number("width")?,
                    height: args.number("height")?,
                    fit: args.fit()?,
                })
            }
            "reqlayout" => {
                let mut args = Args::new("reqlayout", line, rest);
                let degrees: i32 = args.number("rotation")?;
                Ok(Self::ReqLayout {
                    rotation: Rotation::from_degrees(degrees),
                    fit: args.fit()?,
                    height: args.number("height")?,
                })
            }
            "page" => {
                let mut args = Args::new("page", line, rest);
                Ok(Self::Page {
                    page_no: args.number("page number")?,
                    dim_index: args.number("dimension index")?,
                })
            }
            "tile" => {
                let mut args = Args::new("tile", line, rest);
                let page = args.handle("page handle")?;
                let x = args.number("x")?;
                let y = args.number("y")?;
                let width = args.number("width")?;
                let height = args.number("height")?;
                let staging = match args.tokens.next() {
                    Some(token) => {
                        let value = Handle::parse_hex(token).ok_or_else(|| {
                            args.malformed(format!("bad staging handle `{token}`"))
                        })?;
                        Handle::from_wire(value)
                    }
                    None => None,
                };
                Ok(Self::Tile {
                    page,
                    x,
                    y,
                    width,
                    height,
                    staging,
                })
            }
            "sliceh" => Ok(Self::SliceHeight(
                Args::new("sliceh", line, rest).number("slice height")?,
            )),
            "interrupt" => Ok(Self::Interrupt),
            "trimset" => Ok(Self::TrimSet),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { wthack, ack, path } => {
                write!(f, "open {} {ack} {}", u8::from(*wthack), path.display())
            }
            Self::ColorSpace(cs) => write!(f, "cs {}", cs.id()),
            Self::FreePage(h) => write!(f, "freepage {h}"),
            Self::FreeTile(h) => write!(f, "freetile {h}"),
            Self::Geometry { width, height, fit } => {
                write!(f, "geometry {width} {height} {}", fit.id())
            }
            Self::ReqLayout {
                rotation,
                fit,
                height,
            } => write!(f, "reqlayout {} {} {height}", rotation.degrees(), fit.id()),
            Self::Page { page_no, dim_index } => write!(f, "page {page_no} {dim_index}"),
            Self::Tile {
                page,
                x,
                y,
                width,
                height,
                staging,
            } => {
                write!(f, "tile {page} {x} {y} {width} {height} ")?;
                match staging {
                    Some(h) => write!(f, "{h}"),
                    None => f.write_str("0"),
                }
            }
            Self::SliceHeight(h) => write!(f, "sliceh {h}"),
            Self::Interrupt => f.write_str("interrupt"),
            Self::TrimSet => f.write_str("trimset"),
        }
    }
}

/// An outbound reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Msg(String),
    VMsg(String),
    Clear,
    Continue(usize),
    PageDim {
        page_no: usize,
        width: u32,
        height: u32,
        left: i32,
    },
    Outline {
        level: usize,
        page_no: usize,
        title: String,
    },
    Page {
        handle: Handle,
        secs: f64,
    },
    Tile {
        x: usize,
        y: usize,
        handle: Handle,
        bytes: usize,
        secs: f64,
    },
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Msg(text) => write!(f, "msg {text}"),
            Self::VMsg(text) => write!(f, "vmsg {text}"),
            Self::Clear => f.write_str("clear"),
            Self::Continue(count) => write!(f, "continue {count}"),
            Self::PageDim {
                page_no,
                width,
                height,
                left,
            } => write!(f, "pdim {page_no} {width} {height} {left}"),
            Self::Outline {
                level,
                page_no,
                title,
            } => write!(f, "o {level} {page_no} 1 1 {title}"),
            Self::Page { handle, secs } => write!(f, "page {handle} {secs:.6}"),
            Self::Tile {
                x,
                y,
                handle,
                bytes,
                secs,
            } => write!(f, "tile {x} {y} {handle} {bytes} {secs:.6}"),
        }
    }
}

impl FromStr for Reply {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = || ProtocolError::MalformedReply(line.to_string());
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        let mut tokens = rest.split_whitespace();
        let number = |tokens: &mut SplitWhitespace<'_>| -> Result<i64, ProtocolError> {
            tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)
        };
        let handle = |tokens: &mut SplitWhitespace<'_>| -> Result<Handle, ProtocolError> {
            tokens
                .next()
                .and_then(Handle::parse_hex)
                .and_then(Handle::from_wire)
                .ok_or_else(bad)
        };
        let secs = |tokens: &mut SplitWhitespace<'_>| -> Result<f64, ProtocolError> {
            tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)
        };
        let unsigned = |v: i64| usize::try_from(v).map_err(|_| bad());

        let reply = match keyword {
            "msg" => Self::Msg(rest.to_string()),
            "vmsg" => Self::VMsg(rest.to_string()),
            "clear" => Self::Clear,
            "continue" => Self::Continue(unsigned(number(&mut tokens)?)?),
            "pdim" => Self::PageDim {
                page_no: unsigned(number(&mut tokens)?)?,
                width: u32::try_from(number(&mut tokens)?).map_err(|_| bad())?,
                height: u32::try_from(number(&mut tokens)?).map_err(|_| bad())?,
                left: i32::try_from(number(&mut tokens)?).map_err(|_| bad())?,
            },
            "o" => {
                let mut parts = rest.splitn(5, ' ');
                let level = parts.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
                let page_no = parts.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
                let _ = parts.next().ok_or_else(bad)?;
                let _ = parts.next().ok_or_else(bad)?;
                Self::Outline {
                    level,
                    page_no,
                    title: parts.next().unwrap_or_default().to_string(),
                }
            }
            "page" => Self::Page {
                handle: handle(&mut tokens)?,
                secs: secs(&mut tokens)?,
            },
            "tile" => Self::Tile {
                x: unsigned(number(&mut tokens)?)?,
                y: unsigned(number(&mut tokens)?)?,
                handle: handle(&mut tokens)?,
                bytes: unsigned(number(&mut tokens)?)?,
                secs: secs(&mut tokens)?,
            },
            _ => return Err(bad()),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HandleTable;

    fn live_handle() -> Handle {
        HandleTable::new().insert(())
    }

    #[test]
    fn open_keeps_spaces_in_path() {
        let cmd = Command::parse("open 0 7 /tmp/my book/page one.png").unwrap();
        assert_eq!(
            cmd,
            Command::Open {
                wthack: false,
                ack: 7,
                path: PathBuf::from("/tmp/my book/page one.png"),
            }
        );
    }

    #[test]
    fn open_tolerates_repeated_separators() {
        let cmd = Command::parse("open  1   0  doc.png").unwrap();
        assert!(matches!(cmd, Command::Open { wthack: true, path, .. } if path == PathBuf::from("doc.png")));
    }

    #[test]
    fn open_without_path_is_malformed() {
        assert!(matches!(
            Command::parse("open 1 2"),
            Err(ProtocolError::Malformed { command: "open", .. })
        ));
    }

    #[test]
    fn geometry_and_reqlayout() {
        assert_eq!(
            Command::parse("geometry 1000 700 1").unwrap(),
            Command::Geometry {
                width: 1000,
                height: 700,
                fit: FitMode::Proportional,
            }
        );
        assert_eq!(
            Command::parse("reqlayout 90 2 600").unwrap(),
            Command::ReqLayout {
                rotation: Rotation::from_degrees(90),
                fit: FitMode::Page,
                height: 600,
            }
        );
        assert!(Command::parse("geometry 1000 700 3").is_err());
        assert!(Command::parse("geometry 1000 700").is_err());
    }

    #[test]
    fn tile_staging_is_optional_and_zero_means_none() {
        let page = live_handle();
        let with_zero = Command::parse(&format!("tile {page} 0 256 800 256 0")).unwrap();
        let without = Command::parse(&format!("tile {page} 0 256 800 256")).unwrap();
        assert_eq!(with_zero, without);
        assert!(matches!(with_zero, Command::Tile { staging: None, y: 256, .. }));
    }

    #[test]
    fn null_handles_are_rejected() {
        assert!(Command::parse("freepage 0").is_err());
        assert!(Command::parse("freetile zz").is_err());
    }

    #[test]
    fn keywords_match_whole_tokens() {
        assert!(matches!(
            Command::parse("pagex 1 2"),
            Err(ProtocolError::UnknownCommand(k)) if k == "pagex"
        ));
        assert!(matches!(Command::parse("   "), Err(ProtocolError::Empty)));
        assert_eq!(Command::parse("interrupt").unwrap(), Command::Interrupt);
        assert_eq!(Command::parse("trimset 1 2 3").unwrap(), Command::TrimSet);
    }

    #[test]
    fn display_is_parseable() {
        let page = live_handle();
        for cmd in [
            Command::ColorSpace(ColorSpace::Grey),
            Command::SliceHeight(64),
            Command::Tile {
                page,
                x: 1,
                y: 2,
                width: 3,
                height: 4,
                staging: Some(page),
            },
            Command::Open {
                wthack: true,
                ack: 0,
                path: PathBuf::from("a b.png"),
            },
        ] {
            assert_eq!(Command::parse(&cmd.to_string()).unwrap(), cmd);
        }
    }

    #[test]
    fn reply_wire_forms() {
        let h = live_handle();
        assert_eq!(
            Reply::Tile {
                x: 0,
                y: 256,
                handle: h,
                bytes: 12,
                secs: 0.5
            }
            .to_string(),
            "tile 0 256 100000000 12 0.500000"
        );
        assert_eq!(
            Reply::Outline {
                level: 1,
                page_no: 4,
                title: "Part two".into()
            }
            .to_string(),
            "o 1 4 1 1 Part two"
        );
        assert_eq!(
            "o 1 4 1 1 Part two".parse::<Reply>().unwrap(),
            Reply::Outline {
                level: 1,
                page_no: 4,
                title: "Part two".into()
            }
        );
        assert_eq!("continue 3".parse::<Reply>().unwrap(), Reply::Continue(3));
        assert_eq!(
            "pdim 2 10 20 -5".parse::<Reply>().unwrap(),
            Reply::PageDim {
                page_no: 2,
                width: 10,
                height: 20,
                left: -5
            }
        );
        assert!("bogus".parse::<Reply>().is_err());
    }
}
