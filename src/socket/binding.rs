//! Lifecycle policy layer above [`ReconnectingSocket`]
//!
//! Host frameworks re-run their wiring for three distinct reasons: the
//! connection intent changed, the caller toggled the connection on or off,
//! or the framework simply replayed the wiring without any change (hot
//! reload, double-invoked effects). The binding discriminates the three
//! from a caller-supplied options key and a remembered enabled flag, so
//! that replays never drop listeners, a credential refresh while disabled
//! produces exactly one fresh connection, and socket identity is preserved
//! wherever possible.

use super::reconnecting::{ReconnectingSocket, SocketOptions};
use std::sync::Arc;
use tracing::debug;

/// One application of the binding's inputs
#[derive(Debug, Clone)]
pub struct BindingOptions {
    /// Socket options to use if a new socket must be constructed
    pub socket: SocketOptions,
    /// Memo key over the options; two applications carry the same intent
    /// iff their keys are equal
    pub key: String,
    /// Whether the connection should currently exist
    pub enabled: bool,
    /// Leave a newly constructed socket closed instead of connecting it
    pub start_closed: bool,
}

/// Keyed socket supervisor preserving identity across re-applications
pub struct SocketBinding {
    current: Option<Arc<ReconnectingSocket>>,
    /// The socket we have connected (or deliberately left closed); a
    /// replacement is connected on the application that first sees it
    initialized: bool,
    prev_key: Option<String>,
    prev_enabled: bool,
    drifted_while_disabled: bool,
}

impl SocketBinding {
    pub fn new() -> Self {
        Self {
            current: None,
            initialized: false,
            prev_key: None,
            prev_enabled: true,
            drifted_while_disabled: false,
        }
    }

    /// Apply the current inputs and return the socket the caller should use
    pub fn apply(&mut self, options: BindingOptions) -> Arc<ReconnectingSocket> {
        let key_changed = self.prev_key.as_deref() != Some(options.key.as_str());

        if !options.enabled {
            if self.current.is_none() {
                self.current = Some(self.construct(&options));
            } else if let Some(socket) = &self.current {
                socket.close(1000, "disabled");
            }
            if self.prev_key.is_some() && key_changed {
                // remembered so that re-enabling picks up the new options
                self.drifted_while_disabled = true;
            }
            self.prev_key = Some(options.key);
            self.prev_enabled = false;
            return self.current.clone().expect("socket present");
        }

        let toggled_on = !self.prev_enabled;
        if self.current.is_none() {
            self.current = Some(self.construct(&options));
        } else if toggled_on {
            if key_changed || self.drifted_while_disabled {
                debug!("options changed while disabled, replacing socket");
                self.replace(&options);
            } else {
                // identity preserved across a plain disable/enable cycle
                self.current.as_ref().expect("socket present").reconnect();
            }
        } else if key_changed {
            debug!(key = %options.key, "options changed, replacing socket");
            self.replace(&options);
        } else if self.initialized && !options.start_closed {
            // replay without any change: re-establish after the paired
            // teardown without changing identity
            self.current.as_ref().expect("socket present").reconnect();
        }

        if !self.initialized {
            if !options.start_closed {
                self.current.as_ref().expect("socket present").reconnect();
            }
            self.initialized = true;
        }

        self.drifted_while_disabled = false;
        self.prev_key = Some(options.key);
        self.prev_enabled = true;
        self.current.clone().expect("socket present")
    }

    /// Tear down the bound socket
    pub fn release(&mut self) {
        if let Some(socket) = &self.current {
            socket.close(1000, "released");
        }
    }

    fn construct(&mut self, options: &BindingOptions) -> Arc<ReconnectingSocket> {
        // always constructed closed; connection happens on first use
        let mut socket_options = options.socket.clone();
        socket_options.start_closed = true;
        self.initialized = false;
        ReconnectingSocket::new(socket_options)
    }

    fn replace(&mut self, options: &BindingOptions) {
        if let Some(old) = self.current.take() {
            old.close(1000, "replaced");
        }
        self.current = Some(self.construct(options));
    }
}

impl Default for SocketBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SocketBinding {
    fn drop(&mut self) {
        self.release();
    }
}
