//! Per-run session state shared by the protocol engines.
//!
//! A [`Session`] owns the transport for its lifetime and releases it exactly
//! once: when a command fails, on [`Session::close`], or on drop when nobody
//! closed it.

use {
    super::chip::{ChipInfo, SessionState},
    crate::{
        error::{Error, Result},
        port::Port,
        registry::DeviceDescriptor,
    },
    log::{debug, warn},
};

/// Transport plus what the handshake established.
pub struct Session<P: Port> {
    port: P,
    state: SessionState,
    released: bool,
    device: Option<DeviceDescriptor>,
    info: Option<ChipInfo>,
}

impl<P: Port> Session<P> {
    /// Wrap an opened transport.
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: SessionState::Disconnected,
            released: false,
            device: None,
            info: None,
        }
    }

    /// Transport for the next exchange.
    ///
    /// Fails once the transport is released.
    pub fn port(&mut self) -> Result<&mut P> {
        if self.released {
            return Err(Error::Protocol("session is closed".into()));
        }
        Ok(&mut self.port)
    }

    /// Read-only access to the transport.
    pub fn port_ref(&self) -> &P {
        &self.port
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `state` unless the session already failed or closed.
    pub fn advance(&mut self, state: SessionState) {
        if !matches!(self.state, SessionState::Error | SessionState::Closed) {
            self.state = state;
        }
    }

    /// Record the identified chip.
    pub fn identify(&mut self, device: DeviceDescriptor, info: ChipInfo) {
        self.device = Some(device);
        self.info = Some(info);
        self.advance(SessionState::Identified);
    }

    /// Identity learned by the handshake.
    pub fn info(&self) -> Option<&ChipInfo> {
        self.info
            .as_ref()
    }

    /// Mutable identity (lock flag, trimmed frequency).
    pub fn info_mut(&mut self) -> Option<&mut ChipInfo> {
        self.info
            .as_mut()
    }

    /// Descriptor of the identified chip; fails before `connect`.
    pub fn device(&self) -> Result<&DeviceDescriptor> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::Protocol("not connected".into()))
    }

    /// Fail unless the handshake completed and no command failed.
    pub fn require_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Disconnected | SessionState::Identified => {
                Err(Error::Protocol("not connected".into()))
            },
            SessionState::Error => Err(Error::Protocol(
                "session failed earlier; reconnect first".into(),
            )),
            SessionState::Closed => Err(Error::Protocol("session is closed".into())),
            _ => Ok(()),
        }
    }

    /// Pass a result through.
    ///
    /// A failed command moves the session to the error state and releases
    /// the transport; refusals leave both untouched.
    pub fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_refusal() {
                debug!("Refused in state {}: {e}", self.state);
            } else if self.state != SessionState::Closed {
                debug!("Session error in state {}: {e}", self.state);
                self.state = SessionState::Error;
                self.release();
            }
        }
        result
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self
            .port
            .close()
        {
            warn!("Failed to close {}: {e}", self.port.name());
        }
        self.released = true;
    }

    /// Release the transport; later calls do nothing.
    pub fn close(&mut self) {
        self.release();
        self.state = SessionState::Closed;
    }
}

impl<P: Port> Drop for Session<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{port::mock::MockPort, registry::Quirks, target::chip::ProtocolVariant},
    };

    fn info() -> ChipInfo {
        ChipInfo {
            name: "CH552".into(),
            id: 0x1152,
            bootloader: "2.5.0".into(),
            variant: ProtocolVariant::WchV2,
            code_flash_size: 14336,
            data_flash_size: 128,
            uid: None,
            locked: false,
            osc_frequency: None,
        }
    }

    #[test]
    fn test_state_flow() {
        let mut session = Session::new(MockPort::new());
        assert!(session.require_ready().is_err());
        assert!(session.device().is_err());
        session.identify(
            DeviceDescriptor::new(0x1152, "CH552", 14336, 128, Quirks::empty()),
            info(),
        );
        assert_eq!(session.state(), SessionState::Identified);
        session.advance(SessionState::Ready);
        assert!(
            session
                .require_ready()
                .is_ok()
        );
    }

    #[test]
    fn test_error_is_sticky() {
        let mut session = Session::new(MockPort::new());
        session.advance(SessionState::Ready);
        let r: Result<()> = session.track(Err(Error::Timeout("x".into())));
        assert!(r.is_err());
        assert_eq!(session.state(), SessionState::Error);
        session.advance(SessionState::Written);
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.require_ready().is_err());
    }

    #[test]
    fn test_failure_releases_transport() {
        let mut session = Session::new(MockPort::new());
        session.advance(SessionState::Ready);
        let r: Result<()> = session.track(Err(Error::Protocol("nack".into())));
        assert!(r.is_err());
        assert!(
            session
                .port_ref()
                .is_closed()
        );
        assert!(session.port().is_err());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_refusal_keeps_session() {
        let mut session = Session::new(MockPort::new());
        session.advance(SessionState::Ready);
        let r: Result<()> = session.track(Err(Error::LockedChip));
        assert!(r.is_err());
        assert_eq!(session.state(), SessionState::Ready);
        assert!(
            !session
                .port_ref()
                .is_closed()
        );
        assert!(session.port().is_ok());
    }

    #[test]
    fn test_close_once() {
        let mut session = Session::new(MockPort::new());
        session.close();
        assert!(
            session
                .port_ref()
                .is_closed()
        );
        assert!(session.port().is_err());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
