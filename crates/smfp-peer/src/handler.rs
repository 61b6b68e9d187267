use crate::transaction::Transaction;

/// Application logic invoked once per parsed request.
///
/// `handle` runs synchronously inside the connection's parse loop, so it
/// should not block. A handler that needs time moves the transaction into a
/// task and responds from there; responses may go out in any order.
///
/// Each transaction should eventually get exactly one terminal response:
/// `respond(.., true)` or `respond_err`. Nothing enforces a deadline.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, transaction: Transaction);
}

impl<F> RequestHandler for F
where
    F: Fn(Transaction) + Send + Sync + 'static,
{
    fn handle(&self, transaction: Transaction) {
        self(transaction)
    }
}
