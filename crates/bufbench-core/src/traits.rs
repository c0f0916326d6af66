use async_trait::async_trait;

use crate::error::BenchResult;
use crate::test_case::TestCase;

/// Creates and drops the dataset a test case runs against.
#[async_trait]
pub trait DatasetProvisioner: Send + Sync {
    /// Checks that the database server is reachable at all.
    async fn ping(&self) -> BenchResult<()>;

    /// Creates and populates the dataset sized for `test_case`.
    async fn create_dataset(&self, test_case: &TestCase) -> BenchResult<()>;

    /// Drops the dataset created for `test_case`.
    async fn drop_dataset(&self, test_case: &TestCase) -> BenchResult<()>;
}

/// Changes the live capacity parameter of the database server.
///
/// Implementations must be safe to retry with the same target.
#[async_trait]
pub trait CapacityChanger: Send + Sync {
    /// Applies `target_gb` and returns once the server reports it done.
    async fn set_capacity(&self, target_gb: u32) -> BenchResult<()>;

    /// Reads the capacity currently in effect.
    async fn current_capacity(&self) -> BenchResult<u32>;
}

/// Reads host CPU utilisation.
#[async_trait]
pub trait CpuProbe: Send {
    /// Global CPU utilisation in percent since the previous call.
    async fn cpu_percent(&mut self) -> BenchResult<f64>;
}

#[async_trait]
impl<P: CpuProbe + ?Sized> CpuProbe for Box<P> {
    async fn cpu_percent(&mut self) -> BenchResult<f64> {
        (**self).cpu_percent().await
    }
}

/// Append-only destination for one record stream.
///
/// Each sink has exactly one writer; `append` writes a whole record or
/// nothing.
pub trait RecordSink<R>: Send {
    fn append(&mut self, record: &R) -> BenchResult<()>;

    fn flush(&mut self) -> BenchResult<()> {
        Ok(())
    }
}

impl<R, S: RecordSink<R> + ?Sized> RecordSink<R> for Box<S> {
    fn append(&mut self, record: &R) -> BenchResult<()> {
        (**self).append(record)
    }

    fn flush(&mut self) -> BenchResult<()> {
        (**self).flush()
    }
}
