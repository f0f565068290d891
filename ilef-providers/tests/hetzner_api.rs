use ilef_common::waiter::WaitPolicy;
use ilef_common::{InstanceAction, NormalizedStatus, PortSet, ProviderHandle, ProviderKind};
use ilef_providers::hetzner::{HetznerConfig, HetznerProvider};
use ilef_providers::{AdminAccess, CloudProvider, InstanceSpec, ProviderError};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> HetznerProvider {
    let mut config = HetznerConfig::new("test-token".into());
    config.endpoint = Some(server.uri());
    config.cleanup_wait = WaitPolicy::new(Duration::from_millis(10), Duration::from_secs(5));
    HetznerProvider::new(config).unwrap()
}

fn handle() -> ProviderHandle {
    ProviderHandle {
        provider: ProviderKind::Hetzner,
        instance_id: "42".into(),
        instance_name: "app-1-0-ab12-hetzner".into(),
        zone: Some("fsn1".into()),
    }
}

fn rule(port: &str) -> serde_json::Value {
    json!({ "direction": "in", "protocol": "tcp", "port": port, "source_ips": ["0.0.0.0/0", "::/0"] })
}

#[tokio::test]
async fn create_maps_server_and_sends_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/servers"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_string_contains("\"ssh_keys\":[\"deploy\"]"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "server": {
                "id": 42,
                "name": "app-1-0-ab12-hetzner",
                "status": "initializing",
                "created": "2024-06-01T08:00:00+00:00",
                "server_type": { "name": "cx22" },
                "datacenter": { "name": "fsn1-dc14", "location": { "name": "fsn1" } },
                "public_net": { "ipv4": { "ip": "203.0.113.9" } },
                "private_net": []
            },
            "root_password": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (resource, handle) = provider(&server)
        .create_instance(&InstanceSpec {
            name: "app-1-0-ab12-hetzner".into(),
            machine_class: "cx22".into(),
            base_image: None,
            admin: AdminAccess {
                key_name: Some("deploy".into()),
                public_key: None,
            },
        })
        .await
        .unwrap();

    assert_eq!(resource.id, "42");
    assert_eq!(resource.status, NormalizedStatus::Pending);
    assert_eq!(resource.public_address.as_deref(), Some("203.0.113.9"));
    assert_eq!(handle.instance_id, "42");
}

#[tokio::test]
async fn quota_error_is_typed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/servers"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": "resource_limit_exceeded", "message": "server limit exceeded" }
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_instance(&InstanceSpec {
            name: "n".into(),
            machine_class: "cx22".into(),
            base_image: None,
            admin: AdminAccess::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::QuotaExceeded(_)));
}

#[tokio::test]
async fn open_ingress_twice_writes_nothing_when_rules_exist() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/firewalls"))
        .and(query_param("name", "firewall-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "firewalls": [{
                "id": 7,
                "name": "firewall-42",
                "rules": [rule("22"), rule("80"), rule("8080")]
            }]
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/firewalls/7/actions/set_rules"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "actions": [] })))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/firewalls"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let provider = provider(&server);
    let ports = PortSet::from_ports([80, 8080]).unwrap();
    provider.open_ingress(&handle(), &ports).await.unwrap();
    provider.open_ingress(&handle(), &ports).await.unwrap();
}

#[tokio::test]
async fn open_ingress_adds_only_missing_ports() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/firewalls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "firewalls": [{ "id": 7, "name": "firewall-42", "rules": [rule("22")] }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/firewalls/7/actions/set_rules"))
        .and(body_string_contains("\"port\":\"8080\""))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "actions": [] })))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .open_ingress(&handle(), &PortSet::from_ports([8080]).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn open_ingress_creates_firewall_with_admin_port() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/firewalls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "firewalls": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/firewalls"))
        .and(body_string_contains("\"name\":\"firewall-42\""))
        .and(body_string_contains("\"port\":\"22\""))
        .and(body_string_contains("\"port\":\"5000\""))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "firewall": { "id": 8 } })))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .open_ingress(&handle(), &PortSet::from_ports([5000]).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn terminate_removes_key_and_firewall_once_server_is_gone() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/servers/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "action": { "id": 1 } })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/servers/42"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "not_found", "message": "server not found" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/firewalls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "firewalls": [{ "id": 7, "name": "firewall-42", "rules": [] }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/firewalls/7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ssh_keys"))
        .and(query_param("name", "app-1-0-ab12-hetzner-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ssh_keys": [{ "id": 31, "name": "app-1-0-ab12-hetzner-key" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ssh_keys/31"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .manage_instance_action(&handle(), InstanceAction::Terminate)
        .await
        .unwrap();
}

#[tokio::test]
async fn terminate_leaves_keys_alone_when_none_was_uploaded() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/servers/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "action": { "id": 1 } })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/servers/42"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "not_found", "message": "server not found" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/firewalls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "firewalls": [] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ssh_keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ssh_keys": [] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ssh_keys/31"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    provider(&server)
        .manage_instance_action(&handle(), InstanceAction::Terminate)
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_create_deletes_uploaded_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ssh_keys"))
        .and(body_string_contains("\"name\":\"app-1-0-ab12-hetzner-key\""))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "ssh_key": { "id": 31, "name": "app-1-0-ab12-hetzner-key" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/servers"))
        .and(body_string_contains("\"ssh_keys\":[31]"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": "resource_limit_exceeded", "message": "server limit exceeded" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ssh_keys/31"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_instance(&InstanceSpec {
            name: "app-1-0-ab12-hetzner".into(),
            machine_class: "cx22".into(),
            base_image: None,
            admin: AdminAccess {
                key_name: None,
                public_key: Some("ssh-ed25519 AAAAC3Nza deploy@ilef".into()),
            },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::QuotaExceeded(_)), "{err:?}");
}

#[tokio::test]
async fn firewall_rule_limited_to_a_subnet_is_widened() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/firewalls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "firewalls": [{
                "id": 7,
                "name": "firewall-42",
                "rules": [
                    rule("22"),
                    { "direction": "in", "protocol": "tcp", "port": "80", "source_ips": ["10.0.0.0/8"] }
                ]
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/firewalls/7/actions/set_rules"))
        .and(body_string_contains("\"source_ips\":[\"0.0.0.0/0\",\"::/0\"]"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "actions": [] })))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .open_ingress(&handle(), &PortSet::from_ports([80]).unwrap())
        .await
        .unwrap();
}
