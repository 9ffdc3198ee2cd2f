mod common;

mod analysis_pipeline_test;
mod execution_test;
mod monitoring_test;
