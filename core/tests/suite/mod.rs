mod bisection;
mod flake_retries;
mod pipeline_cycle;
mod record_lineage;
mod step_materialize;
