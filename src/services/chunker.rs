//! Re-slices a byte stream into fixed-size windows.
//!
//! Producers emit chunks of whatever size suits them. Uploads and checksums
//! need the same boundaries, so both run the stream through `FixedWindows`:
//! every window is exactly `window_size` bytes except the last, which may be
//! shorter. An empty input yields no windows at all.

use bytes::{Bytes, BytesMut};
use futures::{Stream, ready};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Draining,
    Done,
}

/// Stream adapter yielding `window_size`-byte windows of its input.
pub struct FixedWindows<S> {
    inner: S,
    window_size: usize,
    leftover: BytesMut,
    state: State,
}

impl<S> FixedWindows<S> {
    /// Wrap `inner`. `window_size` must be non-zero.
    pub fn new(inner: S, window_size: usize) -> Self {
        assert!(window_size > 0, "window size must be non-zero");
        Self {
            inner,
            window_size,
            leftover: BytesMut::new(),
            state: State::Reading,
        }
    }
}

impl<S> Stream for FixedWindows<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match this.state {
                State::Done => return Poll::Ready(None),
                State::Draining => {
                    this.state = State::Done;
                    if this.leftover.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(this.leftover.split().freeze())));
                }
                State::Reading => {
                    if this.leftover.len() >= this.window_size {
                        let window = this.leftover.split_to(this.window_size).freeze();
                        return Poll::Ready(Some(Ok(window)));
                    }

                    match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                        Some(Ok(chunk)) => this.leftover.extend_from_slice(&chunk),
                        Some(Err(err)) => {
                            this.state = State::Done;
                            this.leftover.clear();
                            return Poll::Ready(Some(Err(err)));
                        }
                        None => this.state = State::Draining,
                    }
                }
            }
        }
    }
}
