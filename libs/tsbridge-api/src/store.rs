use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;

use crate::error::StoreError;
use crate::value::BindValue;

/// SQL text plus positional bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: Cow<'static, str>,
    pub params: Vec<BindValue>,
}

impl Statement {
    pub fn new(sql: impl Into<Cow<'static, str>>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<Cow<'static, str>>, params: Vec<BindValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Transactional store shared by all writers.
///
/// Implementations lease a connection per call and release it on every
/// exit path. Dropping the returned future before it completes must roll
/// the transaction back and return the connection.
pub trait Store: Send + Sync {
    /// Execute `statements` in order inside one transaction and commit.
    fn transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
