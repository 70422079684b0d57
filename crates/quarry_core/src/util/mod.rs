pub mod primes;
pub mod range_splitter;
