mod failover_test;
