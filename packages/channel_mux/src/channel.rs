use std::sync::Arc;

use crate::session::ChannelSession;

/// Onboarding callback run once for every new connection. It wires the
/// session's handlers and may touch the shared context.
pub type OnConnect<C> = Box<dyn Fn(&mut ChannelSession<C>, &mut C) + Send + Sync>;

/// A named channel declaration.
pub struct Channel<C> {
    name: Arc<str>,
    on_connect: OnConnect<C>,
}

impl<C> Channel<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub(crate) fn onboard(&self, session: &mut ChannelSession<C>, ctx: &mut C) {
        (self.on_connect)(session, ctx);
    }
}

/// The set of channels every connection gets a session for.
///
/// Order matters: sessions are created, and lifecycle events delivered, in
/// the order channels were declared.
pub struct ChannelRegistry<C> {
    channels: Vec<Channel<C>>,
}

impl<C> Default for ChannelRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ChannelRegistry<C> {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
        }
    }

    /// Declare a channel. Declaring an existing name again replaces its
    /// onboarding callback but keeps its original position.
    pub fn of<F>(&mut self, name: &str, on_connect: F) -> &mut Self
    where
        F: Fn(&mut ChannelSession<C>, &mut C) + Send + Sync + 'static,
    {
        let channel = Channel {
            name: Arc::from(name),
            on_connect: Box::new(on_connect),
        };
        match self.channels.iter_mut().find(|c| c.name() == name) {
            Some(existing) => *existing = channel,
            None => self.channels.push(channel),
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel<C>> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
