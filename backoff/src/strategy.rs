/// Exponentially growing delay between attempts, capped and optionally jittered.
pub mod exponential;
