pub mod scenario_tests;
