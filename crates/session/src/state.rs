use serde::Serialize;
use sinc_protocol::{DecodedEvent, LayerState, MacroKeyState};

/// What the host currently knows about the keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionState {
    layer: Option<LayerState>,
    macro_key_disabled: bool,
    connected: bool,
}

/// One field of [`SessionState`] changing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Layer {
        old: Option<LayerState>,
        new: Option<LayerState>,
    },
    MacroKeyDisabled {
        old: bool,
        new: bool,
    },
    Connected {
        old: bool,
        new: bool,
    },
}

/// Notifications published by the controller, in the order things happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    DeviceConnected,
    DeviceDisconnected,
    Changed(StateChange),
}

impl SessionState {
    /// `None` until the keyboard has reported a layer on this connection.
    pub fn layer(&self) -> Option<LayerState> {
        self.layer
    }

    pub fn macro_key_disabled(&self) -> bool {
        self.macro_key_disabled
    }

    pub fn macro_key(&self) -> MacroKeyState {
        if self.macro_key_disabled {
            MacroKeyState::Disabled
        } else {
            MacroKeyState::Enabled
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Folds a decoded frame into the state. Returns the change, if any.
    ///
    /// Macro-key acknowledgements leave the layer alone.
    pub(crate) fn apply(&mut self, event: DecodedEvent) -> Option<StateChange> {
        match event {
            DecodedEvent::LayerAck(layer) | DecodedEvent::LayerEvent(layer) => {
                self.set_layer(Some(layer))
            }
            DecodedEvent::MacroKeyAck(state) => self.set_macro_key_disabled(state.is_disabled()),
            DecodedEvent::Unrecognized => None,
        }
    }

    pub(crate) fn set_connected(&mut self, connected: bool) -> Option<StateChange> {
        let old = std::mem::replace(&mut self.connected, connected);
        (old != connected).then_some(StateChange::Connected { old, new: connected })
    }

    /// Back to the disconnected defaults. Changes come out layer first,
    /// connection flag last.
    pub(crate) fn reset(&mut self) -> Vec<StateChange> {
        [
            self.set_layer(None),
            self.set_macro_key_disabled(false),
            self.set_connected(false),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn set_layer(&mut self, layer: Option<LayerState>) -> Option<StateChange> {
        let old = std::mem::replace(&mut self.layer, layer);
        (old != layer).then_some(StateChange::Layer { old, new: layer })
    }

    fn set_macro_key_disabled(&mut self, disabled: bool) -> Option<StateChange> {
        let old = std::mem::replace(&mut self.macro_key_disabled, disabled);
        (old != disabled).then_some(StateChange::MacroKeyDisabled { old, new: disabled })
    }
}
