//! Test logger - log output goes through the test harness, so it only
//! shows up for failing tests.

pub fn test_logger() {
    //  Only the first call per test binary installs the logger.
    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default());
}
