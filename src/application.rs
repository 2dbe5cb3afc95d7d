//! The Application contract sitting above the [`crate::event::Stack`]
//! (spec §6): receives delivered messages, view changes, and the
//! BLOCK/UNBLOCK pair FLUSH drives during a barrier.

use crate::event::Event;
use crate::message::Message;
use crate::view::View;
use async_trait::async_trait;

/// Implemented by the code using this stack, not by the stack itself.
/// `on_block` must eventually be acknowledged by calling
/// [`crate::protocols::Flush::suspend`]'s caller pattern (replying
/// `BLOCK_OK` through the `Stack`, spec §4.3) before `flush_timeout`
/// elapses, or FLUSH force-acks it on the application's behalf.
#[async_trait]
pub trait Application: Send + Sync {
    async fn on_message(&self, msg: Message);
    async fn on_view_change(&self, view: View);
    async fn on_block(&self);
    async fn on_unblock(&self);
}

/// Routes the events surfaced by [`crate::event::Stack::up`]/`send` to the
/// matching callback, silently dropping event kinds spec §7 doesn't
/// surface upward (only view changes, deliveries and block/unblock do).
pub async fn dispatch(app: &dyn Application, events: Vec<Event>) {
    for event in events {
        match event {
            Event::Msg(msg) => app.on_message(msg).await,
            Event::ViewChange(view) => app.on_view_change(view).await,
            Event::Block => app.on_block().await,
            Event::Unblock => app.on_unblock().await,
            _ => {}
        }
    }
}
