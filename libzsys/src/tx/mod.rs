use crate::error::Result;
use crate::graph::DatasetGraph;
use crate::pooladapter::PoolAdapter;

pub mod ops;

type Compensation = Box<dyn FnOnce(&mut DatasetGraph, &dyn PoolAdapter) + Send>;

/// A unit of work against the pool, backed by a LIFO stack of compensating
/// actions. Dropping a transaction without committing unwinds every
/// compensation pushed so far, last pushed first.
pub struct Transaction {
    compensations: Vec<Compensation>,
    committed: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            compensations: Vec::new(),
            committed: false,
        }
    }

    /// Push a compensating action that undoes the mutation just performed.
    /// Compensations run in reverse order of registration if the
    /// transaction is abandoned instead of committed.
    pub fn push_compensation<F>(&mut self, compensation: F)
    where
        F: FnOnce(&mut DatasetGraph, &dyn PoolAdapter) + Send + 'static,
    {
        self.compensations.push(Box::new(compensation));
    }

    /// Run `body` as a nested sub-transaction. On success its compensations
    /// merge into this transaction's stack; on failure they run immediately,
    /// isolating the failed step's side effects from the parent.
    pub fn nested<F>(&mut self, graph: &mut DatasetGraph, pool: &dyn PoolAdapter, body: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction, &mut DatasetGraph, &dyn PoolAdapter) -> Result<()>,
    {
        let mut sub = Transaction {
            compensations: Vec::new(),
            committed: false,
        };
        let result = body(&mut sub, graph, pool);
        match result {
            Ok(()) => {
                sub.committed = true;
                self.compensations.append(&mut sub.compensations);
                Ok(())
            }
            Err(err) => {
                sub.unwind(graph, pool);
                Err(err)
            }
        }
    }

    /// Mark this transaction as successfully completed; its compensations
    /// stay registered so an enclosing transaction can still unwind them.
    pub fn commit(mut self) {
        self.committed = true;
    }

    fn unwind(&mut self, graph: &mut DatasetGraph, pool: &dyn PoolAdapter) {
        while let Some(compensation) = self.compensations.pop() {
            compensation(graph, pool);
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.committed && !self.compensations.is_empty() {
            slog_scope::warn!(
                "transaction dropped without commit; {} compensation(s) left unexecuted",
                self.compensations.len()
            );
        }
    }
}

/// Runs `body`, unwinding every compensation pushed during it if `body`
/// returns an error, otherwise committing and returning its value.
pub fn run<F, T>(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, body: F) -> Result<T>
where
    F: FnOnce(&mut Transaction, &mut DatasetGraph, &dyn PoolAdapter) -> Result<T>,
{
    let mut tx = Transaction::new();
    match body(&mut tx, graph, pool) {
        Ok(value) => {
            tx.commit();
            Ok(value)
        }
        Err(err) => {
            tx.unwind(graph, pool);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pooladapter::mock::MemoryPoolAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn unwinds_in_lifo_order_on_failure() {
        let pool = MemoryPoolAdapter::new();
        let mut graph = DatasetGraph::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let result: Result<()> = run(&mut graph, &pool, |tx, _graph, _pool| {
            let order = Arc::clone(&order);
            tx.push_compensation(move |_g, _p| order.lock().unwrap().push(1));
            let order = Arc::clone(&order);
            tx.push_compensation(move |_g, _p| order.lock().unwrap().push(2));
            Err(crate::error::ZsysError::Cancelled)
        });

        assert!(result.is_err());
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn nested_failure_isolates_its_own_compensations() {
        let pool = MemoryPoolAdapter::new();
        let mut graph = DatasetGraph::new();
        let outer_ran = Arc::new(AtomicUsize::new(0));
        let inner_ran = Arc::new(AtomicUsize::new(0));

        let outer_ran_clone = Arc::clone(&outer_ran);
        let inner_ran_clone = Arc::clone(&inner_ran);

        let result: Result<()> = run(&mut graph, &pool, move |tx, graph, pool| {
            tx.push_compensation({
                let outer_ran = Arc::clone(&outer_ran_clone);
                move |_g, _p| {
                    outer_ran.fetch_add(1, Ordering::SeqCst);
                }
            });

            let nested_result = tx.nested(graph, pool, {
                let inner_ran = Arc::clone(&inner_ran_clone);
                move |sub_tx, _graph, _pool| {
                    sub_tx.push_compensation(move |_g, _p| {
                        inner_ran.fetch_add(1, Ordering::SeqCst);
                    });
                    Err(crate::error::ZsysError::Cancelled)
                }
            });
            assert!(nested_result.is_err());
            Ok(())
        });

        assert!(result.is_ok());
        assert_eq!(inner_ran.load(Ordering::SeqCst), 1);
        assert_eq!(outer_ran.load(Ordering::SeqCst), 0);
    }
}
