// Copyright 2022 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! The ordered map from protocol ids to inbound stream handlers, shared
//! between the swarm (which dispatches) and the host (which registers).

use crate::Stream;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;

/// An inbound stream handler. Invoked after multistream-select picked the
/// handler's protocol; the stream is already bound to it.
pub type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct StreamHandlers {
    inner: Arc<RwLock<Vec<(String, StreamHandler)>>>,
}

impl StreamHandlers {
    pub fn new() -> StreamHandlers {
        StreamHandlers::default()
    }

    /// Register `handler` for `protocol`, replacing an existing handler for
    /// the same id while keeping its position.
    pub fn set(&self, protocol: impl Into<String>, handler: StreamHandler) {
        let protocol = protocol.into();
        let mut map = self.inner.write();
        match map.iter_mut().find(|(p, _)| *p == protocol) {
            Some(entry) => entry.1 = handler,
            None => map.push((protocol, handler)),
        }
    }

    pub fn remove(&self, protocol: &str) {
        self.inner.write().retain(|(p, _)| p != protocol);
    }

    /// The registered protocol ids, in registration order.
    pub fn protocols(&self) -> Vec<String> {
        self.inner.read().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn get(&self, protocol: &str) -> Option<StreamHandler> {
        self.inner
            .read()
            .iter()
            .find(|(p, _)| p == protocol)
            .map(|(_, h)| h.clone())
    }
}
