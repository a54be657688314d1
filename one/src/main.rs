//! Passport One runs passport anchoring as a single binary.
#![deny(missing_docs)]

use anyhow::Result;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    passport_one::run().await
}
