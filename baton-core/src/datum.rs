use crate::error::DatumError;
use async_trait::async_trait;

/// A unit of application data owned by one primary node at a time.
///
/// Implemented by the application. The cluster only reads `id`,
/// `datum_type` and `name`, and calls `relinquish`/`acquire` around
/// ownership changes.
#[async_trait]
pub trait DistDatum: Send + Sync {
    /// Stable identity within the type. Assignment is `id mod nodes`, so the
    /// id distribution matters.
    fn id(&self) -> i64;

    /// Namespace that, together with `id`, uniquely identifies the datum.
    fn datum_type(&self) -> &str;

    /// Persist or flush state before another node takes over. The next
    /// owner waits for this to finish, up to the transition timeout.
    async fn relinquish(&self) -> Result<(), DatumError>;

    /// Prepare to start owning the datum.
    async fn acquire(&self) -> Result<(), DatumError>;

    /// Label used in logs only.
    fn name(&self) -> String {
        String::new()
    }
}

/// Registry key of a datum, `"<type>:<id>"`.
pub fn datum_key(datum: &dyn DistDatum) -> String {
    format!("{}:{}", datum.datum_type(), datum.id())
}
