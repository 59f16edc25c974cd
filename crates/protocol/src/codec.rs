use crate::types::{LayerState, MacroKeyState, TargetLayer};
use crate::FRAME_LEN;

const SELECT_WINDOWS: &[u8] = b"\x00\x02JMLS0";
const SELECT_MAC: &[u8] = b"\x00\x02JMLS1";
const QUERY_LAYER: &[u8] = b"\x00\x02JMLR";
const DISABLE_MACRO_KEY: &[u8] = b"\x00\x02JMLD";
const ENABLE_MACRO_KEY: &[u8] = b"\x00\x02JMLE";

const ACK_WINDOWS: &[u8] = b"\x00\x02JML\x0f";
const ACK_MAC: &[u8] = b"\x00\x02JML\x0e";
const EVENT_WINDOWS: &[u8] = b"\x00\x02JML0";
const EVENT_MAC: &[u8] = b"\x00\x02JML1";
const ACK_MACRO_DISABLED: &[u8] = b"\x00\x02JMLDS";
const ACK_MACRO_ENABLED: &[u8] = b"\x00\x02JMLES";

/// Requests understood by the keyboard firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SelectWindows,
    SelectMac,
    QueryLayerStatus,
    DisableMacroKey,
    EnableMacroKey,
}

impl Command {
    /// All commands, in wire-table order.
    pub const ALL: [Command; 5] = [
        Command::SelectWindows,
        Command::SelectMac,
        Command::QueryLayerStatus,
        Command::DisableMacroKey,
        Command::EnableMacroKey,
    ];

    pub fn select(layer: TargetLayer) -> Self {
        match layer {
            TargetLayer::Windows => Command::SelectWindows,
            TargetLayer::Mac => Command::SelectMac,
        }
    }

    pub fn macro_key(state: MacroKeyState) -> Self {
        match state {
            MacroKeyState::Enabled => Command::EnableMacroKey,
            MacroKeyState::Disabled => Command::DisableMacroKey,
        }
    }

    /// Wire literal before zero padding.
    pub fn literal(self) -> &'static [u8] {
        match self {
            Command::SelectWindows => SELECT_WINDOWS,
            Command::SelectMac => SELECT_MAC,
            Command::QueryLayerStatus => QUERY_LAYER,
            Command::DisableMacroKey => DISABLE_MACRO_KEY,
            Command::EnableMacroKey => ENABLE_MACRO_KEY,
        }
    }
}

/// Meaning of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedEvent {
    /// Reply to a select or query request.
    LayerAck(LayerState),
    /// Unsolicited: the user switched layers with the hardware key.
    LayerEvent(LayerState),
    MacroKeyAck(MacroKeyState),
    Unrecognized,
}

/// A zero-padded 65-byte frame ready to hand to the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: [u8; FRAME_LEN],
}

impl Frame {
    fn from_literal(literal: &[u8]) -> Self {
        let mut data = [0u8; FRAME_LEN];
        let len = literal.len().min(FRAME_LEN);
        data[..len].copy_from_slice(&literal[..len]);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.data
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Padding is noise in logs.
        write!(f, "Frame({:02X?})", trim_padding(&self.data))
    }
}

pub fn encode(command: Command) -> Frame {
    Frame::from_literal(command.literal())
}

/// Classifies an inbound frame. Total: anything that is not an exact match of
/// a known reply (after stripping the zero padding) is `Unrecognized`.
pub fn decode(frame: &[u8]) -> DecodedEvent {
    match trim_padding(frame) {
        ACK_WINDOWS => DecodedEvent::LayerAck(LayerState::Windows),
        ACK_MAC => DecodedEvent::LayerAck(LayerState::Mac),
        EVENT_WINDOWS => DecodedEvent::LayerEvent(LayerState::Windows),
        EVENT_MAC => DecodedEvent::LayerEvent(LayerState::Mac),
        ACK_MACRO_DISABLED => DecodedEvent::MacroKeyAck(MacroKeyState::Disabled),
        ACK_MACRO_ENABLED => DecodedEvent::MacroKeyAck(MacroKeyState::Enabled),
        _ => DecodedEvent::Unrecognized,
    }
}

fn trim_padding(frame: &[u8]) -> &[u8] {
    let end = frame.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &frame[..end]
}
