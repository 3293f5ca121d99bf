//! Wire protocol spoken with the graph server.
//!
//! Frames are length-prefixed bincode; messages that hand over file
//! descriptors carry them as ancillary data on the same sendmsg (see
//! [`crate::connection`]). The server side of this protocol is the
//! authority for all ids: memory blocks, globals, the node id.

use segue_core::{Direction, IoBuffers, PortType, INVALID_ID, MAX_BUFFERS, MAX_BUFFER_FRAMES};
use serde::{Deserialize, Serialize};

/// String properties attached to globals, nodes and links.
pub type Dict = Vec<(String, String)>;

pub fn dict_lookup<'a>(dict: &'a [(String, String)], key: &str) -> Option<&'a str> {
    dict.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Well-known property keys.
pub mod keys {
    pub const CLIENT_API: &str = "client.api";
    pub const NODE_NAME: &str = "node.name";
    pub const NODE_NICK: &str = "node.nick";
    pub const NODE_DESCRIPTION: &str = "node.description";
    pub const NODE_ID: &str = "node.id";
    pub const NODE_LATENCY: &str = "node.latency";
    pub const NODE_ALWAYS_PROCESS: &str = "node.always-process";
    pub const PRIORITY_MASTER: &str = "priority.master";
    pub const MEDIA_TYPE: &str = "media.type";
    pub const MEDIA_CATEGORY: &str = "media.category";
    pub const MEDIA_ROLE: &str = "media.role";
    pub const FORMAT_DSP: &str = "format.dsp";
    pub const PORT_NAME: &str = "port.name";
    pub const PORT_DIRECTION: &str = "port.direction";
    pub const PORT_PHYSICAL: &str = "port.physical";
    pub const PORT_TERMINAL: &str = "port.terminal";
    pub const PORT_CONTROL: &str = "port.control";
    pub const PORT_ALIAS: &str = "port.alias";
    pub const OBJECT_PATH: &str = "object.path";
    pub const OBJECT_LINGER: &str = "object.linger";
    pub const LINK_OUTPUT_NODE: &str = "link.output.node";
    pub const LINK_OUTPUT_PORT: &str = "link.output.port";
    pub const LINK_INPUT_NODE: &str = "link.input.node";
    pub const LINK_INPUT_PORT: &str = "link.input.port";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Node,
    Port,
    Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireDirection {
    Input,
    Output,
}

impl From<Direction> for WireDirection {
    fn from(d: Direction) -> WireDirection {
        match d {
            Direction::Input => WireDirection::Input,
            Direction::Output => WireDirection::Output,
        }
    }
}

impl From<WireDirection> for Direction {
    fn from(d: WireDirection) -> Direction {
        match d {
            WireDirection::Input => Direction::Input,
            WireDirection::Output => Direction::Output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoKind {
    Buffers,
    Position,
    Clock,
    Control,
}

impl IoKind {
    /// Stable wire value, also used in io mapping tags.
    pub fn raw(self) -> u32 {
        match self {
            IoKind::Buffers => 1,
            IoKind::Clock => 3,
            IoKind::Control => 5,
            IoKind::Position => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    EnumFormat,
    Format,
    Buffers,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCommand {
    Start,
    Pause,
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fract {
    pub num: u32,
    pub denom: u32,
}

/// Integer value with optional negotiation latitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntSpec {
    Fixed(u32),
    Range { default: u32, min: u32, max: u32 },
    Step { default: u32, min: u32, max: u32, step: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RectSpec {
    Fixed(Rect),
    Range { default: Rect, min: Rect, max: Rect },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FractSpec {
    Fixed(Fract),
    Range { default: Fract, min: Fract, max: Fract },
}

/// Only sample format this client speaks on audio ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioSampleFormat {
    F32Planar,
}

/// Only pixel format this client speaks on video ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoPixelFormat {
    RgbaF32,
}

/// Media format, both advertised and imposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatSpec {
    AudioRaw {
        format: AudioSampleFormat,
        rate: IntSpec,
        channels: u32,
    },
    /// `application/control` media: MIDI travels as control sequences.
    Control,
    VideoRaw {
        format: VideoPixelFormat,
        size: RectSpec,
        framerate: FractSpec,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuffersSpec {
    pub buffers: IntSpec,
    pub blocks: u32,
    pub size: IntSpec,
    pub stride: IntSpec,
    pub align: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSpec {
    pub id: IoKind,
    pub size: u32,
}

/// One self-advertised parameter in a port update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamDesc {
    EnumFormat(FormatSpec),
    Format(FormatSpec),
    Buffers(BuffersSpec),
    Io(IoSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDesc {
    pub kind: u32,
    pub size: u32,
}

/// Where one data plane of a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    /// A separate block in the server pool, mapped on its own.
    MemId(u32),
    /// Embedded in the buffer's metadata region at this offset.
    MemPtr { offset: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDesc {
    pub kind: DataKind,
    pub flags: u32,
    pub mapoffset: u32,
    pub maxsize: u32,
}

/// One buffer the server asks us to attach to a mix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDesc {
    pub mem_id: u32,
    pub offset: u32,
    pub size: u32,
    pub metas: Vec<MetaDesc>,
    pub datas: Vec<DataDesc>,
}

/// Info block sent along a port update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfoUpdate {
    pub flags: u32,
    pub props: Dict,
}

/// Ports advertise that their buffers need no reference counting.
pub const PORT_FLAG_NO_REF: u32 = 1 << 0;

/// Node info flag: this node processes in a realtime thread.
pub const NODE_FLAG_RT: u32 = 1 << 0;

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Registers a pool memory block; the memfd rides as ancillary data.
    AddMem {
        mem_id: u32,
        kind: u32,
        flags: u32,
    },
    RemoveMem {
        mem_id: u32,
    },
    Global {
        id: u32,
        kind: ObjectKind,
        props: Dict,
    },
    GlobalRemove {
        id: u32,
    },
    /// Node transport setup: our activation record plus the rt eventfd
    /// pair (read end ours, write end stays with the server).
    Transport {
        node_id: u32,
        mem_id: u32,
        offset: u32,
        size: u32,
    },
    SetParam {
        id: ParamKind,
        flags: u32,
    },
    SetIo {
        id: IoKind,
        mem_id: u32,
        offset: u32,
        size: u32,
    },
    Event {
        kind: u32,
    },
    Command(NodeCommand),
    AddPort {
        direction: WireDirection,
        port_id: u32,
        props: Dict,
    },
    RemovePort {
        direction: WireDirection,
        port_id: u32,
    },
    PortSetParam {
        direction: WireDirection,
        port_id: u32,
        id: ParamKind,
        flags: u32,
        param: Option<FormatSpec>,
    },
    PortUseBuffers {
        direction: WireDirection,
        port_id: u32,
        mix_id: u32,
        flags: u32,
        buffers: Vec<BufferDesc>,
    },
    PortSetIo {
        direction: WireDirection,
        port_id: u32,
        mix_id: u32,
        id: IoKind,
        mem_id: u32,
        offset: u32,
        size: u32,
    },
    /// Peer activation for fan-out signalling; the signal eventfd rides
    /// as ancillary data when the mapping is valid.
    SetActivation {
        node_id: u32,
        mem_id: u32,
        offset: u32,
        size: u32,
    },
    Done {
        seq: u32,
    },
    Error {
        id: u32,
        res: i32,
        message: String,
    },
}

impl ServerEvent {
    /// Number of file descriptors attached to this event.
    pub fn fd_count(&self) -> usize {
        match self {
            ServerEvent::AddMem { .. } => 1,
            ServerEvent::Transport { .. } => 2,
            ServerEvent::SetActivation { mem_id, .. } if *mem_id != INVALID_ID => 1,
            _ => 0,
        }
    }
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    Hello {
        name: String,
        props: Dict,
    },
    Sync {
        seq: u32,
    },
    GetRegistry,
    /// Instantiate a factory object; for us always the client-node.
    CreateObject {
        factory: String,
        props: Dict,
    },
    UpdateInfo {
        max_input_ports: u32,
        max_output_ports: u32,
        flags: u32,
        props: Dict,
    },
    /// Advertise or change one of our ports. Empty params with no info
    /// withdraws the port.
    PortUpdate {
        direction: WireDirection,
        port_id: u32,
        params: Vec<ParamDesc>,
        info: Option<PortInfoUpdate>,
    },
    SetActive {
        active: bool,
    },
    /// Typed error reply on the node, e.g. for unsupported requests.
    NodeError {
        res: i32,
        message: String,
    },
    CreateLink {
        props: Dict,
    },
    DestroyGlobal {
        id: u32,
    },
}

/// EnumFormat advertisement per port type.
pub fn param_enum_format(port_type: PortType) -> Option<FormatSpec> {
    match port_type {
        PortType::Audio => Some(FormatSpec::AudioRaw {
            format: AudioSampleFormat::F32Planar,
            rate: IntSpec::Range {
                default: segue_core::DEFAULT_SAMPLE_RATE,
                min: 1,
                max: i32::MAX as u32,
            },
            channels: 1,
        }),
        PortType::Midi => Some(FormatSpec::Control),
        PortType::Video => Some(FormatSpec::VideoRaw {
            format: VideoPixelFormat::RgbaF32,
            size: RectSpec::Range {
                default: Rect { width: 320, height: 240 },
                min: Rect { width: 1, height: 1 },
                max: Rect { width: i32::MAX as u32, height: i32::MAX as u32 },
            },
            framerate: FractSpec::Range {
                default: Fract { num: 25, denom: 1 },
                min: Fract { num: 0, denom: 1 },
                max: Fract { num: i32::MAX as u32, denom: 1 },
            },
        }),
        PortType::Other => None,
    }
}

/// Format advertisement: like EnumFormat but with the rate pinned once
/// the port has a negotiated format.
pub fn param_format(port_type: PortType, rate: Option<u32>) -> Option<FormatSpec> {
    match port_type {
        PortType::Audio => Some(FormatSpec::AudioRaw {
            format: AudioSampleFormat::F32Planar,
            rate: match rate {
                Some(r) => IntSpec::Fixed(r),
                None => IntSpec::Range {
                    default: segue_core::DEFAULT_SAMPLE_RATE,
                    min: 1,
                    max: i32::MAX as u32,
                },
            },
            channels: 1,
        }),
        _ => param_enum_format(port_type),
    }
}

pub fn param_buffers(port_type: PortType) -> Option<BuffersSpec> {
    let float = std::mem::size_of::<f32>() as u32;
    match port_type {
        PortType::Audio | PortType::Midi => Some(BuffersSpec {
            buffers: IntSpec::Range { default: 1, min: 1, max: MAX_BUFFERS as u32 },
            blocks: 1,
            size: IntSpec::Step {
                default: MAX_BUFFER_FRAMES as u32 * float,
                min: float,
                max: MAX_BUFFER_FRAMES as u32 * float,
                step: float,
            },
            stride: IntSpec::Fixed(float),
            align: 16,
        }),
        PortType::Video => Some(BuffersSpec {
            buffers: IntSpec::Range { default: 1, min: 1, max: MAX_BUFFERS as u32 },
            blocks: 1,
            size: IntSpec::Range {
                default: 320 * 240 * 4 * float,
                min: 0,
                max: i32::MAX as u32,
            },
            stride: IntSpec::Range { default: 4, min: 4, max: i32::MAX as u32 },
            align: 16,
        }),
        PortType::Other => None,
    }
}

pub fn param_io() -> IoSpec {
    IoSpec {
        id: IoKind::Buffers,
        size: std::mem::size_of::<IoBuffers>() as u32,
    }
}

/// The full four-param advertisement emitted on registration and on every
/// format change.
pub fn port_params(port_type: PortType, rate: Option<u32>) -> Vec<ParamDesc> {
    let mut params = Vec::with_capacity(4);
    if let Some(f) = param_enum_format(port_type) {
        params.push(ParamDesc::EnumFormat(f));
    }
    if let Some(f) = param_format(port_type, rate) {
        params.push(ParamDesc::Format(f));
    }
    if let Some(b) = param_buffers(port_type) {
        params.push(ParamDesc::Buffers(b));
    }
    params.push(ParamDesc::Io(param_io()));
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let ev = ServerEvent::PortUseBuffers {
            direction: WireDirection::Input,
            port_id: 3,
            mix_id: 0,
            flags: 0,
            buffers: vec![BufferDesc {
                mem_id: 7,
                offset: 0,
                size: 4096,
                metas: vec![MetaDesc { kind: 1, size: 64 }],
                datas: vec![DataDesc {
                    kind: DataKind::MemId(9),
                    flags: 0,
                    mapoffset: 0,
                    maxsize: 32768,
                }],
            }],
        };
        let bytes = bincode::serialize(&ev).unwrap();
        let back: ServerEvent = bincode::deserialize(&bytes).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn test_request_roundtrip() {
        let req = ClientRequest::PortUpdate {
            direction: WireDirection::Output,
            port_id: 0,
            params: port_params(PortType::Audio, Some(48000)),
            info: Some(PortInfoUpdate {
                flags: PORT_FLAG_NO_REF,
                props: vec![("port.name".into(), "out_L".into())],
            }),
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: ClientRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn test_fd_counts() {
        assert_eq!(
            ServerEvent::AddMem { mem_id: 0, kind: 0, flags: 0 }.fd_count(),
            1
        );
        assert_eq!(
            ServerEvent::Transport { node_id: 1, mem_id: 2, offset: 0, size: 0 }.fd_count(),
            2
        );
        assert_eq!(
            ServerEvent::SetActivation { node_id: 1, mem_id: 2, offset: 0, size: 0 }.fd_count(),
            1
        );
        assert_eq!(
            ServerEvent::SetActivation {
                node_id: 1,
                mem_id: INVALID_ID,
                offset: 0,
                size: 0
            }
            .fd_count(),
            0
        );
        assert_eq!(ServerEvent::Done { seq: 1 }.fd_count(), 0);
    }

    #[test]
    fn test_audio_advertisement_shape() {
        let params = port_params(PortType::Audio, None);
        assert_eq!(params.len(), 4);
        match params[0] {
            ParamDesc::EnumFormat(FormatSpec::AudioRaw { channels, rate, .. }) => {
                assert_eq!(channels, 1);
                assert_eq!(
                    rate,
                    IntSpec::Range { default: 48000, min: 1, max: i32::MAX as u32 }
                );
            }
            ref other => panic!("unexpected param {other:?}"),
        }
        match params[3] {
            ParamDesc::Io(io) => {
                assert_eq!(io.id, IoKind::Buffers);
                assert_eq!(io.size, 8);
            }
            ref other => panic!("unexpected param {other:?}"),
        }
    }

    #[test]
    fn test_midi_advertisement_is_control() {
        let params = port_params(PortType::Midi, None);
        assert!(matches!(params[0], ParamDesc::EnumFormat(FormatSpec::Control)));
        assert!(matches!(params[1], ParamDesc::Format(FormatSpec::Control)));
    }

    #[test]
    fn test_dict_lookup() {
        let dict: Dict = vec![("a".into(), "1".into()), ("b".into(), "2".into())];
        assert_eq!(dict_lookup(&dict, "b"), Some("2"));
        assert_eq!(dict_lookup(&dict, "c"), None);
    }
}
