use crate::codec::{encode_frame, EncodedStream};
use crate::types::{BitPolarity, CanFrame, ErrorFlagKind, FrameField};

/// What a node is currently driving onto the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorMode {
    /// Nothing to offer
    Idle,
    /// Transmitting a prepared data frame
    Frame {
        frame: CanFrame,
        stream: EncodedStream,
    },
    /// Emitting an error flag after a detected bit error
    ErrorFlag { kind: ErrorFlagKind, length: usize },
}

/// Per-node read position over the bits it is offering
#[derive(Debug, Clone)]
pub struct TransmitCursor {
    mode: CursorMode,
    position: usize,
}

impl TransmitCursor {
    pub fn new() -> Self {
        Self {
            mode: CursorMode::Idle,
            position: 0,
        }
    }

    /// Prepare a frame for transmission from its first bit
    pub fn load_frame(&mut self, frame: CanFrame) {
        let stream = encode_frame(&frame);
        self.mode = CursorMode::Frame { frame, stream };
        self.position = 0;
    }

    /// Abandon the current frame and switch to an error flag run
    pub fn begin_error_flag(&mut self, kind: ErrorFlagKind, length: usize) {
        self.mode = CursorMode::ErrorFlag { kind, length };
        self.position = 0;
    }

    /// Next bit this node would drive, if any
    pub fn peek(&self) -> Option<(BitPolarity, FrameField)> {
        match &self.mode {
            CursorMode::Idle => None,
            CursorMode::Frame { stream, .. } => stream.get(self.position),
            CursorMode::ErrorFlag { kind, length } => {
                if self.position < *length {
                    Some((kind.polarity(), FrameField::ErrorFlag))
                } else {
                    None
                }
            }
        }
    }

    pub fn advance(&mut self) {
        if self.peek().is_some() {
            self.position += 1;
        }
    }

    /// Drop whatever is loaded and return to idle
    pub fn reset(&mut self) {
        self.mode = CursorMode::Idle;
        self.position = 0;
    }

    pub fn mode(&self) -> &CursorMode {
        &self.mode
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_idle(&self) -> bool {
        self.mode == CursorMode::Idle
    }

    /// Loaded content fully consumed
    pub fn is_exhausted(&self) -> bool {
        self.peek().is_none()
    }

    pub fn flag_kind(&self) -> Option<ErrorFlagKind> {
        match self.mode {
            CursorMode::ErrorFlag { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Frame being transmitted, if the cursor is in frame mode
    pub fn frame(&self) -> Option<&CanFrame> {
        match &self.mode {
            CursorMode::Frame { frame, .. } => Some(frame),
            _ => None,
        }
    }
}

impl Default for TransmitCursor {
    fn default() -> Self {
        Self::new()
    }
}
