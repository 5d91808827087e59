// ABOUTME: Service/method registry resolving (service, method) names to cached decode+invoke+encode closures.
// ABOUTME: Methods are decoded, invoked, and re-encoded through a closure built once at registration time.

use crate::codec::Codec;
use crate::rpc::error::RpcError;
use crate::rpc::wait_table::CancelToken;
use crate::rpc::wire::RemoteException;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Bytes, RemoteException>> + Send>>;
pub type MethodInvoker = Arc<dyn Fn(Vec<Bytes>, Option<CancelToken>) -> MethodFuture + Send + Sync>;

/// A registered method: whether its terminal formal parameter is a
/// cancellation token (if so, it is not counted among the decoded
/// positional arguments), and the closure that decodes its arguments,
/// invokes the user function, and encodes its result.
///
/// Built once at `register_method` time rather than resolved by reflection
/// at call time.
#[derive(Clone)]
pub struct MethodEntry {
    pub takes_cancel_token: bool,
    pub invoke: MethodInvoker,
}

/// Maps `(service name, method name)` to a [`MethodEntry`].
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, HashMap<String, MethodEntry>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_method(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
        takes_cancel_token: bool,
        invoke: MethodInvoker,
    ) {
        let entry = MethodEntry {
            takes_cancel_token,
            invoke,
        };
        self.services
            .lock()
            .unwrap()
            .entry(service.into())
            .or_default()
            .insert(method.into(), entry);
    }

    /// Registers a two-argument method whose handler is an ordinary async
    /// function; argument decoding and return-value encoding are generated
    /// here from the given [`Codec`], so callers never hand-roll framing.
    pub fn register_method2<A, B, R, C, F, Fut>(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
        codec: C,
        handler: F,
    ) where
        A: DeserializeOwned + Send + 'static,
        B: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        C: Codec + Clone,
        F: Fn(A, B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RemoteException>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let codec = Arc::new(codec);
        let invoke: MethodInvoker = Arc::new(move |args, _cancel| {
            let handler = handler.clone();
            let codec = codec.clone();
            Box::pin(async move {
                if args.len() != 2 {
                    return Err(RemoteException {
                        type_name: "ArityError".to_string(),
                        message: format!("expected 2 arguments, got {}", args.len()),
                        stack: String::new(),
                    });
                }
                let decode_err = |field_index: u8, err: crate::codec::CodecError| RemoteException {
                    type_name: "DecodeError".to_string(),
                    message: format!("argument {field_index}: {err}"),
                    stack: String::new(),
                };
                let a: A = codec
                    .decode_field(&args[0], 0)
                    .map_err(|e| decode_err(0, e))?;
                let b: B = codec
                    .decode_field(&args[1], 1)
                    .map_err(|e| decode_err(1, e))?;
                let result = handler(a, b).await?;
                codec.encode_field(&result, 0).map_err(|e| RemoteException {
                    type_name: "EncodeError".to_string(),
                    message: e.to_string(),
                    stack: String::new(),
                })
            })
        });
        self.register_method(service, method, false, invoke);
    }

    pub fn lookup(&self, service: &str, method: &str) -> Result<MethodEntry, RpcError> {
        let services = self.services.lock().unwrap();
        let methods = services
            .get(service)
            .ok_or_else(|| RpcError::UnknownService(service.to_string()))?;
        methods
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMethod {
                service: service.to_string(),
                method: method.to_string(),
            })
    }
}
