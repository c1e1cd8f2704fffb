//! Access policy hook.
//!
//! Consulted before a request is dispatched; a denial short-circuits to an
//! error status without touching the provider. Real authorization plugs in
//! behind this trait; the built-in policy allows everything.

/// What a request wants to do with a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Monitor,
}

/// One access decision input.
#[derive(Debug)]
pub struct AccessRequest<'a> {
    pub channel: &'a str,
    pub mode: AccessMode,
    /// Peer name from the HELLO handshake, if any.
    pub peer: Option<&'a str>,
}

/// Decides whether a request may proceed.
pub trait AccessPolicy: Send + Sync {
    fn allow(&self, request: &AccessRequest<'_>) -> bool;
}

/// Pass-through policy: every request is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allow(&self, _request: &AccessRequest<'_>) -> bool {
        true
    }
}
