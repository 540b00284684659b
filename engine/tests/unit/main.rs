mod test_cache;
mod test_naming;
mod test_orchestrator;
mod test_refresh;
mod test_session;
