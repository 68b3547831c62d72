mod chain_tests;
mod evictor_tests;
