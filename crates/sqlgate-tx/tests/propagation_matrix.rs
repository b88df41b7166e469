//! Propagation behaviour for every mode, with and without an active
//! transaction on the calling context.

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use sqlgate_core::Error;
use sqlgate_core::testing::MockDb;
use sqlgate_tx::{Propagation, TransactionManager, TxContext, TxOptions};
use std::sync::Arc;

/// What a unit of work observed when it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Violation,
    Ran { in_tx: bool, same_tx: bool },
}

async fn observe(
    mgr: &TransactionManager,
    cx: &Cx,
    ctx: &TxContext,
    propagation: Propagation,
) -> Observed {
    let outer_id = ctx.active().map(|h| h.id());
    let outcome = mgr
        .run_with_propagation(cx, ctx, TxOptions::from(propagation), move |inner| async move {
            let current = inner.active().map(|h| h.id());
            Outcome::<_, Error>::Ok((current.is_some(), current.is_some() && current == outer_id))
        })
        .await;
    match outcome {
        Outcome::Ok((in_tx, same_tx)) => Observed::Ran { in_tx, same_tx },
        Outcome::Err(e) if e.is_propagation_violation() => Observed::Violation,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

fn ran(in_tx: bool, same_tx: bool) -> Observed {
    Observed::Ran { in_tx, same_tx }
}

#[test]
fn propagation_without_active_transaction() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = MockDb::new();
        let mgr = TransactionManager::new(Arc::new(db.provider()));
        let root = TxContext::new();

        let expected = [
            (Propagation::Required, ran(true, false)),
            (Propagation::RequiresNew, ran(true, false)),
            (Propagation::Nested, ran(true, false)),
            (Propagation::NotSupported, ran(false, false)),
            (Propagation::Never, ran(false, false)),
            (Propagation::Mandatory, Observed::Violation),
            (Propagation::Supports, ran(false, false)),
        ];
        for (propagation, want) in expected {
            let got = observe(&mgr, &cx, &root, propagation).await;
            assert_eq!(got, want, "{propagation}");
        }
    });
}

#[test]
fn propagation_with_active_transaction() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = MockDb::new();
        let mgr = TransactionManager::new(Arc::new(db.provider()));
        let outer = match mgr.begin(&cx, &TxOptions::default()).await {
            Outcome::Ok(h) => h,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let ctx = TxContext::new().with_handle(&outer);

        let expected = [
            (Propagation::Required, ran(true, true)),
            (Propagation::RequiresNew, ran(true, false)),
            (Propagation::Nested, ran(true, true)),
            (Propagation::NotSupported, ran(false, false)),
            (Propagation::Never, Observed::Violation),
            (Propagation::Mandatory, ran(true, true)),
            (Propagation::Supports, ran(true, true)),
        ];
        for (propagation, want) in expected {
            let got = observe(&mgr, &cx, &ctx, propagation).await;
            assert_eq!(got, want, "{propagation}");
            assert!(outer.is_active(), "{propagation} must leave the outer handle active");
        }

        assert!(matches!(outer.commit(&cx).await, Outcome::Ok(())));
        // Only the outer handle and the RequiresNew handle touched a connection.
        assert_eq!(db.acquired(), 2);
    });
}

#[test]
fn finished_handle_is_not_current() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = MockDb::new();
        let mgr = TransactionManager::new(Arc::new(db.provider()));
        let outer = match mgr.begin(&cx, &TxOptions::default()).await {
            Outcome::Ok(h) => h,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let ctx = TxContext::new().with_handle(&outer);
        assert!(matches!(outer.rollback(&cx).await, Outcome::Ok(())));

        assert_eq!(
            observe(&mgr, &cx, &ctx, Propagation::Never).await,
            ran(false, false)
        );
        assert_eq!(
            observe(&mgr, &cx, &ctx, Propagation::Mandatory).await,
            Observed::Violation
        );
    });
}
