mod directory_test;
mod exclusion_test;
mod recovery_test;
mod scenarios_test;
