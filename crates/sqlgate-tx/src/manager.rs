//! Propagation-aware transaction manager.
//!
//! [`TransactionManager::run_with_propagation`] is the single boundary
//! through which units of work attach to transactions. It decides, from the
//! caller's [`TxContext`] and the requested [`Propagation`], whether to join
//! the current handle, begin and own a new one, push a savepoint, or run
//! without a transaction. Owned handles are always finished at the boundary
//! that began them: committed on success, rolled back on error, panic or
//! cancellation.

use crate::context::TxContext;
use crate::handle::TransactionHandle;
use crate::options::{Propagation, TxOptions};
use asupersync::{Cx, Outcome};
use futures::FutureExt;
use sqlgate_core::{ConnectionProvider, Error, LinkTarget, TransactionErrorKind, try_outcome};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Instrument;

/// Begins, joins and finishes transactions for units of work.
#[derive(Clone)]
pub struct TransactionManager {
    provider: Arc<dyn ConnectionProvider>,
    target: LinkTarget,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("engine", &self.provider.engine())
            .field("target", &self.target)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn panicked(message: &str) -> Error {
    Error::transaction(
        TransactionErrorKind::Panicked,
        format!("unit of work panicked: {message}"),
    )
}

/// Run `work` with `ctx`, turning panics (raised while building or polling
/// the future) into errors.
async fn guarded<T, F, Fut>(work: F, ctx: TxContext) -> Outcome<T, Error>
where
    F: FnOnce(TxContext) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(move || work(ctx))) {
        Ok(fut) => fut,
        Err(payload) => return Outcome::Err(panicked(&panic_message(payload.as_ref()))),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Outcome::Panicked(p)) => Outcome::Err(panicked(&format!("{p:?}"))),
        Ok(outcome) => outcome,
        Err(payload) => Outcome::Err(panicked(&panic_message(payload.as_ref()))),
    }
}

/// Combine the outcome of a cleanup rollback with the error that caused it.
fn merge_rollback<T>(rollback: Outcome<(), Error>, original: Error) -> Outcome<T, Error> {
    match rollback {
        Outcome::Ok(()) => Outcome::Err(original),
        Outcome::Err(e) => Outcome::Err(Error::rollback_failed(e, original)),
        Outcome::Cancelled(_) => Outcome::Err(Error::rollback_failed(Error::Cancelled, original)),
        Outcome::Panicked(p) => Outcome::Err(Error::rollback_failed(
            Error::Custom(format!("rollback panicked: {p:?}")),
            original,
        )),
    }
}

fn violation(propagation: Propagation, message: &str) -> Error {
    Error::transaction(
        TransactionErrorKind::PropagationViolation,
        format!("propagation {propagation}: {message}"),
    )
}

impl TransactionManager {
    /// Create a manager acquiring connections for the master target.
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            target: LinkTarget::master(),
        }
    }

    /// Acquire connections for `target` instead.
    pub fn with_target(mut self, target: LinkTarget) -> Self {
        self.target = target;
        self
    }

    pub fn target(&self) -> &LinkTarget {
        &self.target
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Begin a new transaction owned by the caller.
    ///
    /// The caller must finish the handle with `commit`, `rollback` or
    /// `close`; bind it to a context with [`TxContext::with_handle`] to let
    /// units of work join it.
    pub async fn begin(&self, cx: &Cx, options: &TxOptions) -> Outcome<Arc<TransactionHandle>, Error> {
        let conn = try_outcome!(self.provider.acquire(cx, &self.target).await);
        TransactionHandle::begin(
            cx,
            conn,
            self.provider.engine(),
            options.isolation,
            options.read_only,
        )
        .await
    }

    /// Run `work` inside a transaction, joining the current one if present.
    pub async fn transaction<T, F, Fut>(&self, cx: &Cx, ctx: &TxContext, work: F) -> Outcome<T, Error>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        self.run_with_propagation(cx, ctx, TxOptions::default(), work)
            .await
    }

    /// Run `work` under `options.propagation` relative to `ctx`.
    ///
    /// `work` receives the context it must use for its own statements and
    /// for any nested boundaries. The caller's `ctx` is never modified, so
    /// a suspended transaction is current again as soon as this returns.
    pub async fn run_with_propagation<T, F, Fut>(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        options: TxOptions,
        work: F,
    ) -> Outcome<T, Error>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        let span = tracing::info_span!(
            "tx_boundary",
            propagation = %options.propagation,
            depth = ctx.depth(),
        );
        self.dispatch(cx, ctx, options, work).instrument(span).await
    }

    async fn dispatch<T, F, Fut>(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        options: TxOptions,
        work: F,
    ) -> Outcome<T, Error>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let current = ctx.active();
        match (options.propagation, current) {
            (Propagation::Never, Some(handle)) => {
                tracing::debug!(tx_id = handle.id(), "Rejecting work: transaction active");
                Outcome::Err(violation(
                    Propagation::Never,
                    "a transaction is already active",
                ))
            }
            (Propagation::Mandatory, None) => Outcome::Err(violation(
                Propagation::Mandatory,
                "no active transaction",
            )),
            (Propagation::Never | Propagation::Supports, None) => {
                guarded(work, ctx.detached()).await
            }
            (
                Propagation::Required | Propagation::Mandatory | Propagation::Supports,
                Some(handle),
            ) => {
                tracing::trace!(tx_id = handle.id(), "Joining transaction");
                guarded(work, ctx.with_handle(&handle)).await
            }
            (Propagation::Required | Propagation::Nested, None) => {
                self.run_owned(cx, ctx, &options, work).await
            }
            (Propagation::Nested, Some(handle)) => self.run_nested(cx, ctx, &handle, work).await,
            (Propagation::RequiresNew, suspended) => {
                if let Some(handle) = &suspended {
                    tracing::debug!(tx_id = handle.id(), "Suspending transaction");
                }
                // The fresh handle must not be able to see the suspended one.
                let result = self.run_owned(cx, &ctx.detached(), &options, work).await;
                if let Some(handle) = &suspended {
                    tracing::debug!(tx_id = handle.id(), "Resuming transaction");
                }
                result
            }
            (Propagation::NotSupported, suspended) => {
                if let Some(handle) = &suspended {
                    tracing::debug!(tx_id = handle.id(), "Suspending transaction");
                }
                let result = guarded(work, ctx.detached()).await;
                if let Some(handle) = &suspended {
                    tracing::debug!(tx_id = handle.id(), "Resuming transaction");
                }
                result
            }
        }
    }

    async fn run_owned<T, F, Fut>(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        options: &TxOptions,
        work: F,
    ) -> Outcome<T, Error>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        let handle = try_outcome!(self.begin(cx, options).await);
        let result = guarded(work, ctx.with_handle(&handle)).await;
        self.finish_owned(cx, &handle, result).await
    }

    async fn finish_owned<T>(
        &self,
        cx: &Cx,
        handle: &TransactionHandle,
        result: Outcome<T, Error>,
    ) -> Outcome<T, Error> {
        match result {
            Outcome::Ok(value) => {
                if let Some(reason) = cx.cancel_reason() {
                    Self::rollback_after_cancel(cx, handle).await;
                    return Outcome::Cancelled(reason);
                }
                match handle.commit(cx).await {
                    Outcome::Ok(()) => Outcome::Ok(value),
                    Outcome::Err(e) => {
                        tracing::warn!(tx_id = handle.id(), error = %e, "Commit failed");
                        if handle.is_active() {
                            merge_rollback(handle.rollback(cx).await, e)
                        } else {
                            Outcome::Err(e)
                        }
                    }
                    Outcome::Cancelled(reason) => {
                        Self::rollback_after_cancel(cx, handle).await;
                        Outcome::Cancelled(reason)
                    }
                    Outcome::Panicked(p) => {
                        let err = Error::Custom(format!("commit panicked: {p:?}"));
                        if handle.is_active() {
                            merge_rollback(handle.rollback(cx).await, err)
                        } else {
                            Outcome::Err(err)
                        }
                    }
                }
            }
            Outcome::Err(e) => {
                tracing::debug!(tx_id = handle.id(), error = %e, "Work failed; rolling back");
                merge_rollback(handle.rollback(cx).await, e)
            }
            Outcome::Cancelled(reason) => {
                Self::rollback_after_cancel(cx, handle).await;
                Outcome::Cancelled(reason)
            }
            Outcome::Panicked(p) => {
                merge_rollback(handle.rollback(cx).await, panicked(&format!("{p:?}")))
            }
        }
    }

    async fn rollback_after_cancel(cx: &Cx, handle: &TransactionHandle) {
        if !handle.is_active() {
            return;
        }
        match handle.rollback(cx).await {
            Outcome::Ok(()) => {
                tracing::debug!(tx_id = handle.id(), "Rolled back cancelled transaction");
            }
            Outcome::Err(e) => {
                tracing::error!(
                    tx_id = handle.id(),
                    error = %e,
                    "Rollback of cancelled transaction failed"
                );
            }
            _ => {
                tracing::error!(
                    tx_id = handle.id(),
                    state = %handle.state(),
                    "Engine did not confirm rollback of cancelled transaction"
                );
            }
        }
    }

    async fn run_nested<T, F, Fut>(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        handle: &Arc<TransactionHandle>,
        work: F,
    ) -> Outcome<T, Error>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        let name = try_outcome!(handle.push_savepoint(cx).await);
        tracing::debug!(tx_id = handle.id(), savepoint = %name, "Entering nested scope");
        let result = guarded(work, ctx.with_handle(handle)).await;
        match result {
            Outcome::Ok(value) => {
                if let Some(reason) = cx.cancel_reason() {
                    if let Outcome::Err(e) = handle.rollback_to(cx, &name).await {
                        tracing::error!(
                            tx_id = handle.id(),
                            savepoint = %name,
                            error = %e,
                            "Rollback to savepoint after cancellation failed"
                        );
                    }
                    return Outcome::Cancelled(reason);
                }
                try_outcome!(handle.release(cx, &name).await);
                Outcome::Ok(value)
            }
            Outcome::Err(e) => {
                tracing::debug!(
                    tx_id = handle.id(),
                    savepoint = %name,
                    error = %e,
                    "Nested work failed; rolling back to savepoint"
                );
                merge_rollback(handle.rollback_to(cx, &name).await, e)
            }
            Outcome::Cancelled(reason) => {
                if let Outcome::Err(e) = handle.rollback_to(cx, &name).await {
                    tracing::error!(
                        tx_id = handle.id(),
                        savepoint = %name,
                        error = %e,
                        "Rollback to savepoint after cancellation failed"
                    );
                }
                Outcome::Cancelled(reason)
            }
            Outcome::Panicked(p) => merge_rollback(
                handle.rollback_to(cx, &name).await,
                panicked(&format!("{p:?}")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleState;
    use asupersync::CancelKind;
    use asupersync::runtime::RuntimeBuilder;
    use sqlgate_core::Link;
    use sqlgate_core::testing::{MockDb, MockResponse};

    fn manager(db: &MockDb) -> TransactionManager {
        TransactionManager::new(Arc::new(db.provider()))
    }

    fn explode() -> Outcome<(), Error> {
        panic!("work exploded")
    }

    fn err_of<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_required_owns_and_commits() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let out = mgr
                .transaction(&cx, &TxContext::new(), |ctx| {
                    let cx = &cx;
                    async move {
                        let tx = ctx.active().expect("active");
                        try_outcome!(tx.execute(cx, "INSERT A", &[]).await);
                        Outcome::Ok(7)
                    }
                })
                .await;
            assert!(matches!(out, Outcome::Ok(7)));
            assert_eq!(db.statements(), vec!["BEGIN", "INSERT A", "COMMIT"]);
            assert_eq!(db.released(), 1);
        });
    }

    #[test]
    fn test_required_rolls_back_on_error() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let out: Outcome<(), Error> = mgr
                .transaction(&cx, &TxContext::new(), |_ctx| async {
                    Outcome::Err(Error::Custom("boom".into()))
                })
                .await;
            assert!(matches!(err_of(out), Error::Custom(m) if m == "boom"));
            assert_eq!(db.statements(), vec!["BEGIN", "ROLLBACK"]);
        });
    }

    #[test]
    fn test_failed_rollback_is_reported_with_original() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("ROLLBACK", MockResponse::Fail("link down".into()));
            let mgr = manager(&db);
            let out: Outcome<(), Error> = mgr
                .transaction(&cx, &TxContext::new(), |_ctx| async {
                    Outcome::Err(Error::Custom("boom".into()))
                })
                .await;
            let err = err_of(out);
            assert_eq!(
                err.transaction_kind(),
                Some(TransactionErrorKind::RollbackFailed)
            );
            assert!(err.to_string().contains("boom"));
            assert!(err.to_string().contains("link down"));
        });
    }

    #[test]
    fn test_commit_failure_rolls_back() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("COMMIT", MockResponse::Fail("serialization failure".into()));
            let mgr = manager(&db);
            let out = mgr
                .transaction(&cx, &TxContext::new(), |_ctx| async { Outcome::Ok(()) })
                .await;
            assert!(matches!(out, Outcome::Err(Error::Query(_))));
            assert_eq!(db.statements(), vec!["BEGIN", "COMMIT", "ROLLBACK"]);
        });
    }

    #[test]
    fn test_begin_failure_never_runs_work() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.set_unavailable(true);
            let mgr = manager(&db);
            let mut ran = false;
            let out = mgr
                .transaction(&cx, &TxContext::new(), |_ctx| {
                    ran = true;
                    async { Outcome::Ok(()) }
                })
                .await;
            assert!(matches!(out, Outcome::Err(Error::Connection(_))));
            assert!(!ran);
        });
    }

    #[test]
    fn test_panic_is_rolled_back_and_returned() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let out: Outcome<(), Error> = mgr
                .transaction(&cx, &TxContext::new(), |_ctx| async { explode() })
                .await;
            let err = err_of(out);
            assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::Panicked));
            assert!(err.to_string().contains("work exploded"));
            assert_eq!(db.statements(), vec!["BEGIN", "ROLLBACK"]);
            assert_eq!(db.released(), 1);
        });
    }

    #[test]
    fn test_panic_while_building_future_is_caught() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let out: Outcome<(), Error> = mgr
                .transaction(&cx, &TxContext::new(), |_ctx| -> std::future::Ready<Outcome<(), Error>> {
                    panic!("eager")
                })
                .await;
            assert_eq!(
                err_of(out).transaction_kind(),
                Some(TransactionErrorKind::Panicked)
            );
            assert_eq!(db.statements(), vec!["BEGIN", "ROLLBACK"]);
        });
    }

    #[test]
    fn test_never_and_mandatory_violations() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);

            let out: Outcome<(), Error> = mgr
                .run_with_propagation(
                    &cx,
                    &TxContext::new(),
                    Propagation::Mandatory.into(),
                    |_ctx| async { Outcome::Ok(()) },
                )
                .await;
            assert!(err_of(out).is_propagation_violation());

            let handle = match mgr.begin(&cx, &TxOptions::default()).await {
                Outcome::Ok(h) => h,
                other => panic!("unexpected outcome: {other:?}"),
            };
            let ctx = TxContext::new().with_handle(&handle);
            let mut calls = 0;
            let out: Outcome<(), Error> = mgr
                .run_with_propagation(&cx, &ctx, Propagation::Never.into(), |_ctx| {
                    calls += 1;
                    async { Outcome::Ok(()) }
                })
                .await;
            assert!(err_of(out).is_propagation_violation());
            assert_eq!(calls, 0);
            assert!(handle.is_active());
        });
    }

    #[test]
    fn test_nested_error_rolls_back_to_savepoint_only() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let out = mgr
                .transaction(&cx, &TxContext::new(), |ctx| {
                    let (cx, mgr) = (&cx, &mgr);
                    async move {
                        let tx = ctx.active().expect("active");
                        try_outcome!(tx.execute(cx, "INSERT A", &[]).await);
                        let inner: Outcome<(), Error> = mgr
                            .run_with_propagation(cx, &ctx, Propagation::Nested.into(), |ctx| {
                                async move {
                                    let tx = ctx.active().expect("active");
                                    try_outcome!(tx.execute(cx, "INSERT B", &[]).await);
                                    Outcome::Err(Error::Custom("inner failed".into()))
                                }
                            })
                            .await;
                        assert!(matches!(inner, Outcome::Err(Error::Custom(_))));
                        assert!(tx.is_active());
                        Outcome::Ok(())
                    }
                })
                .await;
            assert!(matches!(out, Outcome::Ok(())));
            assert_eq!(
                db.statements(),
                vec![
                    "BEGIN",
                    "INSERT A",
                    "SAVEPOINT sp_1",
                    "INSERT B",
                    "ROLLBACK TO SAVEPOINT sp_1",
                    "COMMIT",
                ]
            );
        });
    }

    #[test]
    fn test_nested_success_releases_savepoint() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let out = mgr
                .transaction(&cx, &TxContext::new(), |ctx| {
                    let (cx, mgr) = (&cx, &mgr);
                    async move {
                        mgr.run_with_propagation(cx, &ctx, Propagation::Nested.into(), |ctx| {
                            async move {
                                assert_eq!(ctx.active().expect("active").depth(), 1);
                                Outcome::Ok(())
                            }
                        })
                        .await
                    }
                })
                .await;
            assert!(matches!(out, Outcome::Ok(())));
            assert_eq!(
                db.statements(),
                vec!["BEGIN", "SAVEPOINT sp_1", "RELEASE SAVEPOINT sp_1", "COMMIT"]
            );
        });
    }

    #[test]
    fn test_cancel_before_commit_rolls_back() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let mut seen = None;
            let out = mgr
                .transaction(&cx, &TxContext::new(), |ctx| {
                    let (cx, seen) = (&cx, &mut seen);
                    async move {
                        let tx = ctx.active().expect("active");
                        try_outcome!(tx.execute(cx, "INSERT A", &[]).await);
                        *seen = Some(tx);
                        cx.cancel_with(CancelKind::User, None);
                        Outcome::Ok(())
                    }
                })
                .await;
            assert!(matches!(out, Outcome::Cancelled(_)));
            assert_eq!(db.statements(), vec!["BEGIN", "INSERT A", "ROLLBACK"]);
            assert_eq!(db.acquired(), db.released());
            let tx = seen.expect("handle");
            assert_eq!(tx.state(), HandleState::RolledBack);
        });
    }

    #[test]
    fn test_cancel_inside_nested_scope_unwinds_both_levels() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let out = mgr
                .transaction(&cx, &TxContext::new(), |ctx| {
                    let (cx, mgr) = (&cx, &mgr);
                    async move {
                        let inner: Outcome<(), Error> = mgr
                            .run_with_propagation(cx, &ctx, Propagation::Nested.into(), |ctx| {
                                async move {
                                    let tx = ctx.active().expect("active");
                                    try_outcome!(tx.execute(cx, "INSERT B", &[]).await);
                                    cx.cancel_with(CancelKind::User, None);
                                    Outcome::Ok(())
                                }
                            })
                            .await;
                        assert!(matches!(inner, Outcome::Cancelled(_)));
                        assert_eq!(ctx.active().expect("active").depth(), 1);
                        inner
                    }
                })
                .await;
            assert!(matches!(out, Outcome::Cancelled(_)));
            assert_eq!(
                db.statements(),
                vec![
                    "BEGIN",
                    "SAVEPOINT sp_1",
                    "INSERT B",
                    "ROLLBACK TO SAVEPOINT sp_1",
                    "ROLLBACK",
                ]
            );
            assert_eq!(db.acquired(), db.released());
        });
    }

    #[test]
    fn test_requires_new_uses_separate_connection() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);
            let out: Outcome<(), Error> = mgr
                .transaction(&cx, &TxContext::new(), |ctx| {
                    let (cx, mgr) = (&cx, &mgr);
                    async move {
                        let outer = ctx.active().expect("active");
                        let inner = mgr
                            .run_with_propagation(cx, &ctx, Propagation::RequiresNew.into(), |ctx| {
                                let outer_id = outer.id();
                                async move {
                                    let tx = ctx.active().expect("active");
                                    assert_ne!(tx.id(), outer_id);
                                    try_outcome!(tx.execute(cx, "INSERT INNER", &[]).await);
                                    Outcome::Ok(())
                                }
                            })
                            .await;
                        assert!(matches!(inner, Outcome::Ok(())));
                        // The outer transaction is current again.
                        assert_eq!(ctx.active().map(|h| h.id()), Some(outer.id()));
                        Outcome::Err(Error::Custom("outer failed".into()))
                    }
                })
                .await;
            assert!(matches!(out, Outcome::Err(_)));
            assert_eq!(
                db.log(),
                vec![
                    "c1: BEGIN",
                    "c2: BEGIN",
                    "c2: INSERT INNER",
                    "c2: COMMIT",
                    "c1: ROLLBACK",
                ]
            );
            assert_eq!(db.acquired(), 2);
            assert_eq!(db.released(), 2);
        });
    }

    #[test]
    fn test_not_supported_and_supports_run_without_transaction() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let mgr = manager(&db);

            let seen = mgr
                .run_with_propagation(&cx, &TxContext::new(), Propagation::Supports.into(), |ctx| {
                    async move { Outcome::Ok(ctx.in_transaction()) }
                })
                .await;
            assert!(matches!(seen, Outcome::Ok(false)));

            let handle = match mgr.begin(&cx, &TxOptions::default()).await {
                Outcome::Ok(h) => h,
                other => panic!("unexpected outcome: {other:?}"),
            };
            let ctx = TxContext::new().with_handle(&handle);
            let seen = mgr
                .run_with_propagation(&cx, &ctx, Propagation::NotSupported.into(), |inner| {
                    async move { Outcome::Ok(inner.in_transaction()) }
                })
                .await;
            assert!(matches!(seen, Outcome::Ok(false)));
            assert!(ctx.in_transaction());
            assert_eq!(db.statements(), vec!["BEGIN"]);
        });
    }
}
