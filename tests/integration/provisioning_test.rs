use payment_service::models::UserCreated;
use payment_service::payments::{
    init_db, run_migrations, AccountProvisioner, PgAccountProvisioner, Provisioned,
};
use payment_service::rabbitmq::{ConnectionManager, Publisher, Topology, UserCreatedConsumer};
use std::sync::Arc;
use std::time::Duration;

async fn provisioner() -> PgAccountProvisioner {
    let pool = init_db(&super::database_url()).await.expect("database reachable");
    run_migrations(&pool).await.expect("migrations apply");
    PgAccountProvisioner::new(pool)
}

fn random_user_id() -> i64 {
    (uuid::Uuid::new_v4().as_u128() % i64::MAX as u128) as i64
}

#[tokio::test]
#[ignore] // Requires a running PostgreSQL instance
async fn test_create_if_absent_is_idempotent() {
    let provisioner = provisioner().await;
    let user_id = random_user_id();

    let first = provisioner.create_if_absent(user_id, "alice", "a@x.com").await.unwrap();
    let second = provisioner.create_if_absent(user_id, "alice", "a@x.com").await.unwrap();

    assert!(first.is_created());
    assert_eq!(second, Provisioned::Existing(first.account_id()));

    let account = provisioner.find_by_user_id(user_id).await.unwrap().unwrap();
    assert_eq!(account.id, first.account_id());
    assert_eq!(account.balance, 0.0);
}

#[tokio::test]
#[ignore] // Requires a running PostgreSQL instance
async fn test_concurrent_duplicates_leave_one_account() {
    let provisioner = Arc::new(provisioner().await);
    let user_id = random_user_id();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let provisioner = provisioner.clone();
            tokio::spawn(async move { provisioner.create_if_absent(user_id, "bob", "b@x.com").await })
        })
        .collect();

    let mut created = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().is_created() {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment_accounts WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(provisioner.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[ignore] // Requires running RabbitMQ and PostgreSQL instances
async fn test_published_event_is_provisioned_once() {
    let provisioner = Arc::new(provisioner().await);
    let exchange = format!("payments-test-{}", uuid::Uuid::new_v4());
    let queue = format!("user-created-{}", uuid::Uuid::new_v4());

    let mut manager = ConnectionManager::new(&super::amqp_addr(), &exchange, "topic");
    let connection = manager.connect().await.unwrap();
    Topology::new(&exchange, &queue, "user.created").bind(&connection).await.unwrap();

    let consumer = UserCreatedConsumer::new(connection.clone(), &queue, provisioner.clone())
        .start()
        .await
        .unwrap();

    let user_id = random_user_id();
    let publisher = Publisher::new(connection.clone(), &exchange);
    let event = UserCreated::new(user_id, "alice", "a@x.com");
    publisher.publish_user_created(&event).await.unwrap();
    publisher.publish_user_created(&event).await.unwrap();
    publisher.publish("user.created", "not an event").await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = consumer.shutdown().await.unwrap();

    assert_eq!(stats.received, 3);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.existing, 1);
    assert_eq!(stats.undecodable, 1);
    assert!(provisioner.find_by_user_id(user_id).await.unwrap().is_some());

    manager.close().await.unwrap();
}
