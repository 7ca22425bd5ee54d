//! Wire formats.
//!
//! Binary messages use native-endian integers and IEEE-754 doubles, since simulation and server
//! processes run on the same machine architecture. The launcher channel is plain ASCII text.

use crate::error::EnsembleError;
use crate::types::SimulationStatus;

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
// Bring traits into scope to use as_bytes and read_from_prefix methods.
use zerocopy::{AsBytes, FromBytes};

/// Width of the NUL-padded field name block in a data message.
pub const FIELD_NAME_LEN: usize = 128;

/// Width of each NUL-padded node name in a handshake response.
pub const NODE_NAME_LEN: usize = 64;

/// Fixed header of a data message.
#[derive(AsBytes, Clone, Copy, Debug, Default, FromBytes, PartialEq)]
#[repr(C)]
pub struct DataHeader {
    pub timestep: i32,
    pub simu_id: i32,
    pub client_rank: i32,
    pub vect_size: i32,
}

const HEADER_LEN: usize = std::mem::size_of::<DataHeader>();

fn to_i32(value: usize, what: &str) -> Result<i32, EnsembleError> {
    i32::try_from(value).map_err(|_| EnsembleError::protocol(format!("{what} {value} overflows i32")))
}

fn to_usize(value: i32, what: &str) -> Result<usize, EnsembleError> {
    usize::try_from(value).map_err(|_| EnsembleError::protocol(format!("negative {what} {value}")))
}

/// Copies `name` into a NUL-padded block of `width` bytes.
fn put_name(buf: &mut BytesMut, name: &str, width: usize) -> Result<(), EnsembleError> {
    if name.len() > width || name.contains('\0') {
        return Err(EnsembleError::protocol(format!(
            "name {name:?} does not fit in {width} bytes"
        )));
    }
    buf.put_slice(name.as_bytes());
    buf.put_bytes(0, width - name.len());
    Ok(())
}

/// Reads a NUL-padded name.
fn get_name(block: &[u8]) -> Result<String, EnsembleError> {
    let end = block.iter().position(|b| *b == 0).unwrap_or(block.len());
    std::str::from_utf8(&block[..end])
        .map(str::to_owned)
        .map_err(|_| EnsembleError::protocol("name is not valid UTF-8"))
}

fn get_i32s(bytes: &[u8], count: usize) -> Result<Vec<i32>, EnsembleError> {
    let len = count * std::mem::size_of::<i32>();
    if bytes.len() < len {
        return Err(EnsembleError::protocol(format!(
            "expected {count} integers, got {} bytes",
            bytes.len()
        )));
    }
    let mut values = vec![0_i32; count];
    values.as_bytes_mut().copy_from_slice(&bytes[..len]);
    Ok(values)
}

/// A decoded data message: one slice of one field at one timestep for one group.
#[derive(Clone, Debug, PartialEq)]
pub struct DataMessage {
    pub timestep: usize,
    pub simu_id: usize,
    pub client_rank: usize,
    pub field: String,
    pub vect_size: usize,
    /// `vect_size * k` values, vectors concatenated.
    pub payload: Vec<f64>,
}

impl DataMessage {
    /// Decodes a message carrying `vectors` vectors.
    pub fn decode(bytes: &[u8], vectors: usize) -> Result<Self, EnsembleError> {
        let header = DataHeader::read_from_prefix(bytes)
            .ok_or_else(|| EnsembleError::protocol("data message shorter than its header"))?;
        let rest = &bytes[HEADER_LEN..];
        if rest.len() < FIELD_NAME_LEN {
            return Err(EnsembleError::protocol("data message truncated in field name"));
        }
        let field = get_name(&rest[..FIELD_NAME_LEN])?;
        let body = &rest[FIELD_NAME_LEN..];

        let vect_size = to_usize(header.vect_size, "vect_size")?;
        let expected = vect_size * vectors * std::mem::size_of::<f64>();
        if body.len() != expected {
            return Err(EnsembleError::protocol(format!(
                "data message for {field} carries {} bytes, header declares {expected}",
                body.len()
            )));
        }
        let mut payload = vec![0.0_f64; vect_size * vectors];
        payload.as_bytes_mut().copy_from_slice(body);

        Ok(Self {
            timestep: to_usize(header.timestep, "timestep")?,
            simu_id: to_usize(header.simu_id, "simulation id")?,
            client_rank: to_usize(header.client_rank, "client rank")?,
            field,
            vect_size,
            payload,
        })
    }

    /// The carried vectors, in order `[A, B, C_1, ...]` under Sobol'.
    pub fn vectors(&self) -> Vec<&[f64]> {
        if self.vect_size == 0 {
            return Vec::new();
        }
        self.payload.chunks_exact(self.vect_size).collect()
    }
}

/// Assembles and validates a data message before it is sent.
#[derive(Debug)]
pub struct DataMessageBuilder<'a> {
    field: &'a str,
    timestep: usize,
    simu_id: usize,
    client_rank: usize,
    vectors: Vec<&'a [f64]>,
}

impl<'a> DataMessageBuilder<'a> {
    pub fn new(field: &'a str, timestep: usize, simu_id: usize, client_rank: usize) -> Self {
        Self {
            field,
            timestep,
            simu_id,
            client_rank,
            vectors: Vec::new(),
        }
    }

    pub fn vector(mut self, values: &'a [f64]) -> Self {
        self.vectors.push(values);
        self
    }

    /// Encodes the message, checking that exactly `expected_vectors` vectors of equal length
    /// were supplied.
    pub fn build(self, expected_vectors: usize) -> Result<Bytes, EnsembleError> {
        if self.vectors.len() != expected_vectors {
            return Err(EnsembleError::protocol(format!(
                "expected {expected_vectors} vectors, got {}",
                self.vectors.len()
            )));
        }
        let vect_size = self.vectors.first().map_or(0, |v| v.len());
        if let Some(bad) = self.vectors.iter().find(|v| v.len() != vect_size) {
            return Err(EnsembleError::protocol(format!(
                "vector of length {} does not match vect_size {vect_size}",
                bad.len()
            )));
        }
        let header = DataHeader {
            timestep: to_i32(self.timestep, "timestep")?,
            simu_id: to_i32(self.simu_id, "simulation id")?,
            client_rank: to_i32(self.client_rank, "client rank")?,
            vect_size: to_i32(vect_size, "vect_size")?,
        };
        let payload_len = vect_size * expected_vectors * std::mem::size_of::<f64>();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + FIELD_NAME_LEN + payload_len);
        buf.put_slice(header.as_bytes());
        put_name(&mut buf, self.field, FIELD_NAME_LEN)?;
        for vector in &self.vectors {
            buf.put_slice(vector.as_bytes());
        }
        debug_assert_eq!(buf.len(), HEADER_LEN + FIELD_NAME_LEN + payload_len);
        Ok(buf.freeze())
    }
}

/// First message of a simulation: its process count, group id and per-process slice sizes.
#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeRequest {
    pub simu_id: usize,
    pub client_sizes: Vec<usize>,
}

impl HandshakeRequest {
    pub fn client_comm_size(&self) -> usize {
        self.client_sizes.len()
    }

    pub fn encode(&self) -> Result<Bytes, EnsembleError> {
        let mut buf = BytesMut::with_capacity(4 * (2 + self.client_sizes.len()));
        buf.put_slice(to_i32(self.client_comm_size(), "client count")?.as_bytes());
        buf.put_slice(to_i32(self.simu_id, "simulation id")?.as_bytes());
        for size in &self.client_sizes {
            buf.put_slice(to_i32(*size, "slice size")?.as_bytes());
        }
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnsembleError> {
        let fixed = get_i32s(bytes, 2)?;
        let count = to_usize(fixed[0], "client count")?;
        let simu_id = to_usize(fixed[1], "simulation id")?;
        if bytes.len() != 4 * (2 + count) {
            return Err(EnsembleError::protocol(format!(
                "handshake declares {count} clients but carries {} bytes",
                bytes.len()
            )));
        }
        let client_sizes = get_i32s(&bytes[8..], count)?
            .into_iter()
            .map(|size| to_usize(size, "slice size"))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            simu_id,
            client_sizes,
        })
    }
}

/// The server's answer to a handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeResponse {
    pub sobol: bool,
    pub learning: bool,
    pub nb_parameters: usize,
    pub verbosity: i32,
    /// One `host:port` data endpoint per server rank.
    pub node_names: Vec<String>,
}

impl HandshakeResponse {
    pub fn server_count(&self) -> usize {
        self.node_names.len()
    }

    pub fn encode(&self) -> Result<Bytes, EnsembleError> {
        let mut buf = BytesMut::with_capacity(20 + NODE_NAME_LEN * self.node_names.len());
        for value in [
            to_i32(self.server_count(), "server count")?,
            i32::from(self.sobol),
            i32::from(self.learning),
            to_i32(self.nb_parameters, "nb_parameters")?,
            self.verbosity,
        ] {
            buf.put_slice(value.as_bytes());
        }
        for name in &self.node_names {
            put_name(&mut buf, name, NODE_NAME_LEN)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnsembleError> {
        let fixed = get_i32s(bytes, 5)?;
        let server_count = to_usize(fixed[0], "server count")?;
        let names = &bytes[20..];
        if names.len() != server_count * NODE_NAME_LEN {
            return Err(EnsembleError::protocol(format!(
                "handshake response declares {server_count} servers but carries {} name bytes",
                names.len()
            )));
        }
        let node_names = names
            .chunks_exact(NODE_NAME_LEN)
            .map(get_name)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            sobol: fixed[1] != 0,
            learning: fixed[2] != 0,
            nb_parameters: to_usize(fixed[3], "nb_parameters")?,
            verbosity: fixed[4],
            node_names,
        })
    }
}

/// A message on the launcher text channel, in either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum LauncherMessage {
    /// A job was submitted for a group, with the group's parameters.
    Job {
        simu_id: usize,
        job_id: String,
        parameters: Vec<f64>,
    },
    /// The launcher gave up on a group.
    Drop { simu_id: usize, job_id: String },
    /// `timeout -1` from the launcher is a heartbeat; `timeout <id>` from the server reports a
    /// group reset.
    Timeout { simu_id: Option<usize> },
    /// Server asks for the parameters of a group.
    SimuInfoRequest { simu_id: usize },
    /// Launcher answers a [LauncherMessage::SimuInfoRequest].
    SimuInfo {
        simu_id: usize,
        parameters: Vec<f64>,
    },
    SimuStatus {
        simu_id: usize,
        status: SimulationStatus,
    },
    Converged { rank: usize },
    OptionsRequest,
    /// Serialised options, as JSON.
    Options(String),
    Stop,
}

impl fmt::Display for LauncherMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LauncherMessage::Job {
                simu_id,
                job_id,
                parameters,
            } => {
                write!(f, "job {simu_id} {job_id}")?;
                parameters.iter().try_for_each(|p| write!(f, " {p}"))
            }
            LauncherMessage::Drop { simu_id, job_id } => write!(f, "drop {simu_id} {job_id}"),
            LauncherMessage::Timeout { simu_id: None } => write!(f, "timeout -1"),
            LauncherMessage::Timeout { simu_id: Some(id) } => write!(f, "timeout {id}"),
            LauncherMessage::SimuInfoRequest { simu_id } => write!(f, "simu_info {simu_id}"),
            LauncherMessage::SimuInfo {
                simu_id,
                parameters,
            } => {
                write!(f, "simu_info {simu_id}")?;
                parameters.iter().try_for_each(|p| write!(f, " {p}"))
            }
            LauncherMessage::SimuStatus { simu_id, status } => {
                write!(f, "simu_status {simu_id} {}", status.code())
            }
            LauncherMessage::Converged { rank } => write!(f, "converged {rank}"),
            LauncherMessage::OptionsRequest => write!(f, "options"),
            LauncherMessage::Options(json) => write!(f, "options {json}"),
            LauncherMessage::Stop => write!(f, "stop"),
        }
    }
}

fn parse_field<T: FromStr>(token: Option<&str>, what: &str, line: &str) -> Result<T, EnsembleError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| EnsembleError::protocol(format!("bad or missing {what} in {line:?}")))
}

fn parse_parameters<'a>(
    tokens: impl Iterator<Item = &'a str>,
    line: &str,
) -> Result<Vec<f64>, EnsembleError> {
    tokens
        .map(|t| parse_field(Some(t), "parameter", line))
        .collect()
}

impl FromStr for LauncherMessage {
    type Err = EnsembleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if let Some(json) = line.strip_prefix("options ") {
            return Ok(LauncherMessage::Options(json.to_owned()));
        }
        let mut tokens = line.split_ascii_whitespace();
        let command = tokens.next().unwrap_or_default();
        let message = match command {
            "job" => LauncherMessage::Job {
                simu_id: parse_field(tokens.next(), "simulation id", line)?,
                job_id: parse_field(tokens.next(), "job id", line)?,
                parameters: parse_parameters(tokens.by_ref(), line)?,
            },
            "drop" => LauncherMessage::Drop {
                simu_id: parse_field(tokens.next(), "simulation id", line)?,
                job_id: parse_field(tokens.next(), "job id", line)?,
            },
            "timeout" => {
                let id: i64 = parse_field(tokens.next(), "simulation id", line)?;
                LauncherMessage::Timeout {
                    simu_id: usize::try_from(id).ok(),
                }
            }
            "simu_info" => {
                let simu_id = parse_field(tokens.next(), "simulation id", line)?;
                let parameters = parse_parameters(tokens.by_ref(), line)?;
                if parameters.is_empty() {
                    LauncherMessage::SimuInfoRequest { simu_id }
                } else {
                    LauncherMessage::SimuInfo {
                        simu_id,
                        parameters,
                    }
                }
            }
            "simu_status" => {
                let simu_id = parse_field(tokens.next(), "simulation id", line)?;
                let code: i32 = parse_field(tokens.next(), "status", line)?;
                let status = SimulationStatus::try_from(code).map_err(|code| {
                    EnsembleError::protocol(format!("unknown simulation status {code}"))
                })?;
                LauncherMessage::SimuStatus { simu_id, status }
            }
            "converged" => LauncherMessage::Converged {
                rank: parse_field(tokens.next(), "rank", line)?,
            },
            "options" => LauncherMessage::OptionsRequest,
            "stop" => LauncherMessage::Stop,
            other => {
                return Err(EnsembleError::protocol(format!(
                    "unknown launcher command {other:?}"
                )))
            }
        };
        if tokens.next().is_some() {
            return Err(EnsembleError::protocol(format!(
                "trailing tokens in {line:?}"
            )));
        }
        Ok(message)
    }
}
