//! End-to-end scenarios: full runs against an in-process mock agent

mod helpers;
mod mock_agent;

mod basic;
mod cancellation;
mod concurrency_group;
mod dynamic_upload;
mod failure_cascade;
mod matrix;
mod parallelism;
mod wait_barrier;
