use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};

use engine::Completion;

/// A fully buffered response body that keeps the request's [`Completion`]
/// alive until the connection is done with it. Dropping the body runs the
/// request's close hooks and writes its access-log line.
pub struct ClosingBody {
    data: Option<Bytes>,
    len: u64,
    _completion: Completion,
}

impl ClosingBody {
    pub fn new(data: Bytes, completion: Completion) -> Self {
        let len = data.len() as u64;
        Self {
            data: (!data.is_empty()).then_some(data),
            len,
            _completion: completion,
        }
    }
}

impl Body for ClosingBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(self.get_mut().data.take().map(|data| Ok(Frame::data(data))))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.data {
            Some(_) => SizeHint::with_exact(self.len),
            None => SizeHint::with_exact(0),
        }
    }
}
