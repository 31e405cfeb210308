mod test_heartbeat;
