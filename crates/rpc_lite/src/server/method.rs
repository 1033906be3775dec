use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::context::CallContext;
use crate::error::{BoxError, RpcError};

/// A decoded request or an unencoded response, erased so that methods with
/// different message types can share one registry and one interceptor chain.
pub type Message = Box<dyn Any + Send>;

/// Result flowing back through the interceptor chain.
pub type CallResult = Result<Message, RpcError>;

pub type DecodeFn = Arc<dyn Fn(Bytes) -> Result<Message, RpcError> + Send + Sync>;

pub type EncodeFn = Arc<dyn Fn(Message) -> Result<Bytes, RpcError> + Send + Sync>;

pub type InvokeFn<S> =
    Arc<dyn Fn(Arc<S>, CallContext, Message) -> BoxFuture<'static, CallResult> + Send + Sync>;

/// A registered method: name plus its decode, invoke and encode functions.
///
/// `S` is the shared service state handed to every invocation.
pub struct Method<S> {
    name: Arc<str>,
    decode: DecodeFn,
    invoke: InvokeFn<S>,
    encode: EncodeFn,
}

impl<S> Clone for Method<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            decode: Arc::clone(&self.decode),
            invoke: Arc::clone(&self.invoke),
            encode: Arc::clone(&self.encode),
        }
    }
}

impl<S> fmt::Debug for Method<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method").field("name", &self.name).finish()
    }
}

impl<S: Send + Sync + 'static> Method<S> {
    /// Build a method from typed decode, invoke and encode functions.
    ///
    /// This handles the boxing and downcasting between the typed functions and
    /// the erased [`Message`] the chain works with.
    pub fn new<Req, Resp, D, F, Fut, E>(
        name: impl Into<Arc<str>>,
        decode: D,
        invoke: F,
        encode: E,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        D: Fn(Bytes) -> Result<Req, BoxError> + Send + Sync + 'static,
        F: Fn(Arc<S>, CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
        E: Fn(Resp) -> Result<Bytes, BoxError> + Send + Sync + 'static,
    {
        let decode: DecodeFn = Arc::new(move |raw: Bytes| {
            decode(raw)
                .map(|req| Box::new(req) as Message)
                .map_err(|e| RpcError::Decode(e.to_string()))
        });

        let invoke: InvokeFn<S> = Arc::new(
            move |state: Arc<S>, ctx: CallContext, req: Message| -> BoxFuture<'static, CallResult> {
                match req.downcast::<Req>() {
                    Ok(req) => {
                        let fut = invoke(state, ctx, *req);
                        async move { fut.await.map(|resp| Box::new(resp) as Message) }.boxed()
                    }
                    Err(_) => async {
                        Err(RpcError::Internal(
                            "request type does not match the method".to_string(),
                        ))
                    }
                    .boxed(),
                }
            },
        );

        let encode: EncodeFn = Arc::new(move |resp: Message| match resp.downcast::<Resp>() {
            Ok(resp) => encode(*resp).map_err(|e| RpcError::Encode(e.to_string())),
            Err(_) => Err(RpcError::Encode(
                "response type does not match the method".to_string(),
            )),
        });

        Self {
            name: name.into(),
            decode,
            invoke,
            encode,
        }
    }

    /// Build a method whose request and response are protobuf messages.
    pub fn unary<Req, Resp, F, Fut>(name: impl Into<Arc<str>>, handler: F) -> Self
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Send + 'static,
        F: Fn(Arc<S>, CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        Self::new(
            name,
            |raw: Bytes| Req::decode(raw).map_err(BoxError::from),
            handler,
            |resp: Resp| Ok(Bytes::from(resp.encode_to_vec())),
        )
    }
}

impl<S> Method<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn decode(&self, raw: Bytes) -> Result<Message, RpcError> {
        (self.decode)(raw)
    }

    pub fn encode(&self, resp: Message) -> Result<Bytes, RpcError> {
        (self.encode)(resp)
    }

    pub fn invoke_fn(&self) -> &InvokeFn<S> {
        &self.invoke
    }
}
