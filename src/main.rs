/// Terminal entry point for tabstream
///
/// This is a thin wrapper that delegates to the library crate.
/// All application code and runtime setup lives in lib.rs.
fn main() -> anyhow::Result<()> {
    tabstream_lib::run()
}
