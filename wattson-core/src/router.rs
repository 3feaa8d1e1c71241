//! The Query Router (spec §4.2, C2): ordered handler-chain dispatch.
//!
//! Handlers are tried in registration order: first the core handler
//! (registration, events, time, shutdown, configuration, notification
//! history/send), then the controller (a no-op by default, a seam for
//! deployment-specific extensions), then each registered simulator in the
//! order it joined. The first handler that claims a query type and returns
//! a response wins, unless the request opts into `allow_multi_handling`.

use crate::error::{ErrorCode, WattsonError};
use crate::message::{MultiRequest, MultiResponse, Payload, Request, Response};

/// Work a [`Handler`] wants performed only after its response has been
/// flushed to the client — e.g. `REQUEST_SHUTDOWN`'s "stop the controller
/// after acknowledging the request" (spec §4.2, step 5).
pub type PostSendCallback = Box<dyn FnOnce() + Send>;

/// What a [`Handler`] hands back to the router for one claimed request.
pub struct HandlerOutcome {
    pub payload: Payload,
    pub post_send: Option<PostSendCallback>,
}

impl HandlerOutcome {
    pub fn payload(payload: Payload) -> Self {
        Self {
            payload,
            post_send: None,
        }
    }

    pub fn with_post_send(payload: Payload, callback: PostSendCallback) -> Self {
        Self {
            payload,
            post_send: Some(callback),
        }
    }
}

/// A participant in query dispatch: the core handler, the controller, or a
/// simulator.
pub trait Handler: Send + Sync {
    /// A human-readable name for logging (e.g. `"core"`, `"network"`).
    fn name(&self) -> &str;

    /// Whether this handler is willing to process `query_type`.
    fn claims(&self, query_type: &str) -> bool;

    /// Processes `request`. Returning `Ok(None)` means "claimed but
    /// produced no answer" (rare; treated the same as unhandled by the
    /// router, since every claimed query is expected to answer). Returning
    /// `Err` short-circuits the chain with a failure response.
    fn handle(&self, request: &Request) -> Result<Option<HandlerOutcome>, WattsonError>;
}

/// The outcome of routing a single [`Request`]: the wire-visible
/// [`Response`] plus any deferred work to run after it has been sent.
pub struct RoutedResponse {
    pub response: Response,
    pub post_send: Option<PostSendCallback>,
}

/// Holds the ordered handler chain and dispatches requests through it.
#[derive(Default)]
pub struct Router {
    handlers: Vec<Box<dyn Handler>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Appends a handler to the end of the chain (spec §4.2: core handler
    /// first, then the controller, then simulators in registration order —
    /// callers are responsible for registering in that order).
    pub fn register(&mut self, handler: Box<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Routes a single request through the handler chain (spec §4.2, steps
    /// 2-4).
    pub fn route(&self, request: &Request) -> RoutedResponse {
        let mut handled = false;
        let mut outcome: Option<HandlerOutcome> = None;

        for handler in &self.handlers {
            if !handler.claims(&request.query_type) {
                continue;
            }
            if handled && !request.allow_multi_handling {
                break;
            }
            match handler.handle(request) {
                Ok(Some(result)) => {
                    handled = true;
                    let is_last = outcome.is_none() || request.allow_multi_handling;
                    if is_last {
                        outcome = Some(result);
                    }
                    if !request.allow_multi_handling {
                        break;
                    }
                }
                Ok(None) => {
                    // Claimed but produced nothing: treat as not handled by
                    // this handler, keep walking the chain.
                }
                Err(err) => {
                    tracing::debug!(
                        handler = handler.name(),
                        query_type = %request.query_type,
                        error = %err,
                        "handler raised while processing request"
                    );
                    return RoutedResponse {
                        response: Response::from_error(request.id, &err),
                        post_send: None,
                    };
                }
            }
        }

        match outcome {
            Some(result) => RoutedResponse {
                response: Response::ok(request.id, result.payload),
                post_send: result.post_send,
            },
            None => RoutedResponse {
                response: Response::from_error(
                    request.id,
                    &WattsonError::new(ErrorCode::Unhandled, format!("no handler claimed query type '{}'", request.query_type)),
                ),
                post_send: None,
            },
        }
    }

    /// Routes a batch request (spec §4.2, step 1): every sub-request is
    /// dispatched independently and mixed success/failure is permitted.
    pub fn route_multi(&self, multi: &MultiRequest) -> (MultiResponse, Vec<PostSendCallback>) {
        let mut responses = Vec::with_capacity(multi.requests.len());
        let mut callbacks = Vec::new();
        for sub_request in &multi.requests {
            let routed = self.route(sub_request);
            if let Some(callback) = routed.post_send {
                callbacks.push(callback);
            }
            responses.push(routed.response);
        }
        (
            MultiResponse {
                id: multi.id,
                responses,
            },
            callbacks,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct EchoHandler;

    impl Handler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }

        fn claims(&self, query_type: &str) -> bool {
            query_type == "ECHO"
        }

        fn handle(&self, request: &Request) -> Result<Option<HandlerOutcome>, WattsonError> {
            Ok(Some(HandlerOutcome::payload(request.payload.clone())))
        }
    }

    struct FailingHandler;

    impl Handler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }

        fn claims(&self, query_type: &str) -> bool {
            query_type == "BOOM"
        }

        fn handle(&self, _request: &Request) -> Result<Option<HandlerOutcome>, WattsonError> {
            Err(WattsonError::internal("kaboom"))
        }
    }

    #[test]
    fn unclaimed_query_type_is_unhandled() {
        let router = Router::new();
        let routed = router.route(&Request::new(1, "NONSENSE"));
        match routed.response {
            Response::Err { code, .. } => assert_eq!(code, ErrorCode::Unhandled),
            other => panic!("expected Err, got {other:?}"),
        }
    }

    #[test]
    fn first_claiming_handler_wins_without_allow_multi_handling() {
        let mut router = Router::new();
        router.register(Box::new(EchoHandler));
        let routed = router.route(&Request::new(5, "ECHO"));
        match routed.response {
            Response::Ok { id, .. } => assert_eq!(id, 5),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn handler_error_becomes_failure_response() {
        let mut router = Router::new();
        router.register(Box::new(FailingHandler));
        let routed = router.route(&Request::new(2, "BOOM"));
        match routed.response {
            Response::Err { code, error, .. } => {
                assert_eq!(code, ErrorCode::Internal);
                assert_eq!(error, "kaboom");
            }
            other => panic!("expected Err, got {other:?}"),
        }
    }

    #[test]
    fn post_send_callback_runs_only_when_invoked_by_caller() {
        let counter = Arc::new(AtomicUsize::new(0));
        struct ShutdownHandler(Arc<AtomicUsize>);
        impl Handler for ShutdownHandler {
            fn name(&self) -> &str {
                "shutdown"
            }
            fn claims(&self, query_type: &str) -> bool {
                query_type == "REQUEST_SHUTDOWN"
            }
            fn handle(&self, request: &Request) -> Result<Option<HandlerOutcome>, WattsonError> {
                let counter = self.0.clone();
                Ok(Some(HandlerOutcome::with_post_send(
                    request.payload.clone(),
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )))
            }
        }

        let mut router = Router::new();
        router.register(Box::new(ShutdownHandler(counter.clone())));
        let routed = router.route(&Request::new(9, "REQUEST_SHUTDOWN"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        if let Some(callback) = routed.post_send {
            callback();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multi_request_collects_mixed_success_and_failure() {
        let mut router = Router::new();
        router.register(Box::new(EchoHandler));
        let multi = MultiRequest {
            id: 1,
            requests: vec![Request::new(1, "ECHO"), Request::new(2, "NONSENSE")],
        };
        let (response, _callbacks) = router.route_multi(&multi);
        assert_eq!(response.responses.len(), 2);
        assert!(matches!(response.responses[0], Response::Ok { .. }));
        assert!(matches!(response.responses[1], Response::Err { .. }));
    }
}
