mod common;
mod job_queue_tests;
mod kv_tests;
