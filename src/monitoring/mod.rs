use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram, register_int_counter, register_int_counter_vec,
    Histogram, IntCounter, IntCounterVec,
};

pub static API_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kairos_api_requests_total",
        "API requests by path and status class",
        &["path", "status"]
    )
    .unwrap()
});

pub static MINT_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "kairos_mint_duration_seconds",
        "Time to slice, embed and store one document",
        exponential_buckets(0.01, 2.0, 12).unwrap()
    )
    .unwrap()
});

pub static MINTED_STEPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("kairos_minted_steps_total", "Steps written to the vector store")
        .unwrap()
});

pub static EMBEDDING_FALLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kairos_embedding_fallbacks_total",
        "Batches stored with zero vectors after an embedding failure"
    )
    .unwrap()
});

pub static PROOF_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kairos_proof_failures_total",
        "Rejected proof solutions by error code",
        &["code"]
    )
    .unwrap()
});

pub static CIRCUITS_OPENED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kairos_circuits_opened_total",
        "Steps that exhausted their proof retries"
    )
    .unwrap()
});

pub static SEARCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kairos_searches_total",
        "Search requests by outcome role of the best choice",
        &["role"]
    )
    .unwrap()
});
