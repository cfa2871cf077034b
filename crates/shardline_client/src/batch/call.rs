use std::time::Instant;

use tokio::sync::oneshot;

use super::BatchKind;
use crate::error::{ClientError, ClientResult};
use crate::model::{
    DeleteRangeRequest, DeleteRangeResponse, DeleteRequest, DeleteResponse, GetRequest,
    GetResponse, PutRequest, PutResponse,
};

/// Completion channel for one call. Invoked exactly once, with success or error.
pub type Callback<T> = oneshot::Sender<ClientResult<T>>;

/// Operation type of a call, used for routing, metrics, and error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Put,
    Delete,
    DeleteRange,
    Get,
}

impl OpKind {
    pub const ALL: [OpKind; 4] = [OpKind::Put, OpKind::Delete, OpKind::DeleteRange, OpKind::Get];

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Put => "put",
            OpKind::Delete => "delete",
            OpKind::DeleteRange => "delete_range",
            OpKind::Get => "get",
        }
    }

    pub fn batch_kind(self) -> BatchKind {
        match self {
            OpKind::Get => BatchKind::Read,
            OpKind::Put | OpKind::Delete | OpKind::DeleteRange => BatchKind::Write,
        }
    }
}

#[derive(Debug)]
pub struct PutCall {
    pub request: PutRequest,
    pub callback: Callback<PutResponse>,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct DeleteCall {
    pub request: DeleteRequest,
    pub callback: Callback<DeleteResponse>,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct DeleteRangeCall {
    pub request: DeleteRangeRequest,
    pub callback: Callback<DeleteRangeResponse>,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct GetCall {
    pub request: GetRequest,
    pub callback: Callback<GetResponse>,
    pub enqueued_at: Instant,
}

/// One caller operation waiting in a batcher.
#[derive(Debug)]
pub enum Call {
    Put(PutCall),
    Delete(DeleteCall),
    DeleteRange(DeleteRangeCall),
    Get(GetCall),
}

impl Call {
    pub fn put(request: PutRequest) -> (Call, oneshot::Receiver<ClientResult<PutResponse>>) {
        let (callback, rx) = oneshot::channel();
        let call = Call::Put(PutCall {
            request,
            callback,
            enqueued_at: Instant::now(),
        });
        (call, rx)
    }

    pub fn delete(
        request: DeleteRequest,
    ) -> (Call, oneshot::Receiver<ClientResult<DeleteResponse>>) {
        let (callback, rx) = oneshot::channel();
        let call = Call::Delete(DeleteCall {
            request,
            callback,
            enqueued_at: Instant::now(),
        });
        (call, rx)
    }

    pub fn delete_range(
        request: DeleteRangeRequest,
    ) -> (Call, oneshot::Receiver<ClientResult<DeleteRangeResponse>>) {
        let (callback, rx) = oneshot::channel();
        let call = Call::DeleteRange(DeleteRangeCall {
            request,
            callback,
            enqueued_at: Instant::now(),
        });
        (call, rx)
    }

    pub fn get(request: GetRequest) -> (Call, oneshot::Receiver<ClientResult<GetResponse>>) {
        let (callback, rx) = oneshot::channel();
        let call = Call::Get(GetCall {
            request,
            callback,
            enqueued_at: Instant::now(),
        });
        (call, rx)
    }

    pub fn op(&self) -> OpKind {
        match self {
            Call::Put(_) => OpKind::Put,
            Call::Delete(_) => OpKind::Delete,
            Call::DeleteRange(_) => OpKind::DeleteRange,
            Call::Get(_) => OpKind::Get,
        }
    }

    pub fn kind(&self) -> BatchKind {
        self.op().batch_kind()
    }

    pub fn enqueued_at(&self) -> Instant {
        match self {
            Call::Put(call) => call.enqueued_at,
            Call::Delete(call) => call.enqueued_at,
            Call::DeleteRange(call) => call.enqueued_at,
            Call::Get(call) => call.enqueued_at,
        }
    }

    /// Bytes this call contributes toward a write batch's size cap.
    pub fn payload_size(&self) -> usize {
        match self {
            Call::Put(call) => call.request.key.len() + call.request.value.len(),
            Call::Delete(call) => call.request.key.len(),
            Call::DeleteRange(call) => {
                call.request.start_inclusive.len() + call.request.end_exclusive.len()
            }
            Call::Get(call) => call.request.key.len(),
        }
    }

    /// Complete the call with `err`. A caller that stopped waiting is ignored.
    pub fn fail(self, err: ClientError) {
        match self {
            Call::Put(call) => {
                let _ = call.callback.send(Err(err));
            }
            Call::Delete(call) => {
                let _ = call.callback.send(Err(err));
            }
            Call::DeleteRange(call) => {
                let _ = call.callback.send(Err(err));
            }
            Call::Get(call) => {
                let _ = call.callback.send(Err(err));
            }
        }
    }
}
