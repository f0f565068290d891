use ilef_common::{InstanceAction, NormalizedStatus, PortSet, ProviderHandle, ProviderKind};
use ilef_providers::aws::{AwsConfig, AwsProvider};
use ilef_providers::{AdminAccess, CloudProvider, InstanceSpec, ProviderError};
use wiremock::matchers::{body_string_contains, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> AwsProvider {
    let mut config = AwsConfig::new("AKIDTEST".into(), "secret".into(), "us-east-1".into());
    config.endpoint = Some(server.uri());
    AwsProvider::new(config).unwrap()
}

fn handle() -> ProviderHandle {
    ProviderHandle {
        provider: ProviderKind::Aws,
        instance_id: "i-0598c7d356eba48d7".into(),
        instance_name: "app-1-0-k3x9-aws".into(),
        zone: Some("us-east-1a".into()),
    }
}

fn xml(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/xml;charset=UTF-8")
}

const GROUP_WITH_PORTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeSecurityGroupsResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <requestId>req-1</requestId>
  <securityGroupInfo>
    <item>
      <groupId>sg-0abc</groupId>
      <groupName>app-1-0-k3x9-aws-sg</groupName>
      <ipPermissions>
        <item>
          <ipProtocol>tcp</ipProtocol><fromPort>22</fromPort><toPort>22</toPort>
          <ipRanges><item><cidrIp>0.0.0.0/0</cidrIp></item></ipRanges>
        </item>
        <item>
          <ipProtocol>tcp</ipProtocol><fromPort>80</fromPort><toPort>80</toPort>
          <ipRanges><item><cidrIp>0.0.0.0/0</cidrIp></item></ipRanges>
        </item>
        <item>
          <ipProtocol>tcp</ipProtocol><fromPort>8080</fromPort><toPort>8080</toPort>
          <ipRanges><item><cidrIp>0.0.0.0/0</cidrIp></item></ipRanges>
        </item>
      </ipPermissions>
    </item>
  </securityGroupInfo>
</DescribeSecurityGroupsResponse>"#;

const GROUP_ADMIN_ONLY: &str = r#"<DescribeSecurityGroupsResponse>
  <securityGroupInfo>
    <item>
      <groupId>sg-0abc</groupId>
      <ipPermissions>
        <item>
          <ipProtocol>tcp</ipProtocol><fromPort>22</fromPort><toPort>22</toPort>
          <ipRanges><item><cidrIp>0.0.0.0/0</cidrIp></item></ipRanges>
        </item>
      </ipPermissions>
    </item>
  </securityGroupInfo>
</DescribeSecurityGroupsResponse>"#;

#[tokio::test]
async fn open_ingress_twice_does_not_authorize_again() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header_exists("authorization"))
        .and(body_string_contains("Action=DescribeSecurityGroups"))
        .and(body_string_contains("app-1-0-k3x9-aws-sg"))
        .respond_with(xml(GROUP_WITH_PORTS))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=AuthorizeSecurityGroupIngress"))
        .respond_with(xml("<AuthorizeSecurityGroupIngressResponse><return>true</return></AuthorizeSecurityGroupIngressResponse>"))
        .expect(0)
        .mount(&server)
        .await;

    let provider = provider(&server);
    let ports = PortSet::from_ports([8080]).unwrap().with_required();
    provider.open_ingress(&handle(), &ports).await.unwrap();
    provider.open_ingress(&handle(), &ports).await.unwrap();
}

#[tokio::test]
async fn open_ingress_authorizes_only_missing_ports() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeSecurityGroups"))
        .respond_with(xml(GROUP_ADMIN_ONLY))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=AuthorizeSecurityGroupIngress"))
        .and(body_string_contains("IpPermissions.1.FromPort=5000"))
        .respond_with(xml("<AuthorizeSecurityGroupIngressResponse><return>true</return></AuthorizeSecurityGroupIngressResponse>"))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .open_ingress(&handle(), &PortSet::from_ports([5000]).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn instance_limit_is_reported_as_quota() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeSecurityGroups"))
        .respond_with(xml(GROUP_ADMIN_ONLY))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=RunInstances"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<Response><Errors><Error><Code>InstanceLimitExceeded</Code>\
             <Message>You have requested more instances than your current instance limit allows</Message>\
             </Error></Errors><RequestID>req-2</RequestID></Response>",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_instance(&InstanceSpec {
            name: "app-1-0-k3x9-aws".into(),
            machine_class: "t3.micro".into(),
            base_image: None,
            admin: AdminAccess {
                key_name: Some("deploy".into()),
                public_key: None,
            },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::QuotaExceeded(_)), "{err:?}");
}

#[tokio::test]
async fn get_instance_reads_addresses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeInstances"))
        .and(body_string_contains("InstanceId.1=i-0598c7d356eba48d7"))
        .respond_with(xml(
            r#"<DescribeInstancesResponse>
  <reservationSet>
    <item>
      <instancesSet>
        <item>
          <instanceId>i-0598c7d356eba48d7</instanceId>
          <instanceState><code>16</code><name>running</name></instanceState>
          <instanceType>t3.micro</instanceType>
          <privateIpAddress>172.31.20.5</privateIpAddress>
          <ipAddress>54.10.20.30</ipAddress>
        </item>
      </instancesSet>
    </item>
  </reservationSet>
</DescribeInstancesResponse>"#,
        ))
        .mount(&server)
        .await;

    let resource = provider(&server).get_instance(&handle()).await.unwrap();
    assert_eq!(resource.status, NormalizedStatus::Running);
    assert_eq!(resource.reachable_address(), Some("54.10.20.30"));
    assert_eq!(resource.private_address.as_deref(), Some("172.31.20.5"));
}

const NO_GROUPS: &str = "<DescribeSecurityGroupsResponse><requestId>req-3</requestId></DescribeSecurityGroupsResponse>";

const ACK: &str = "<Response><return>true</return></Response>";

#[tokio::test]
async fn failed_launch_rolls_back_group_and_imported_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=ImportKeyPair"))
        .and(body_string_contains("KeyName=app-1-0-k3x9-aws-key"))
        .respond_with(xml("<ImportKeyPairResponse><keyName>app-1-0-k3x9-aws-key</keyName></ImportKeyPairResponse>"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeSecurityGroups"))
        .respond_with(xml(NO_GROUPS))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeVpcs"))
        .respond_with(xml(
            "<DescribeVpcsResponse><vpcSet><item><vpcId>vpc-1</vpcId></item></vpcSet></DescribeVpcsResponse>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=CreateSecurityGroup"))
        .respond_with(xml("<CreateSecurityGroupResponse><groupId>sg-0new</groupId></CreateSecurityGroupResponse>"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=AuthorizeSecurityGroupIngress"))
        .respond_with(xml(ACK))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=RunInstances"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<Response><Errors><Error><Code>InsufficientInstanceCapacity</Code>\
             <Message>no capacity</Message></Error></Errors></Response>",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteSecurityGroup"))
        .and(body_string_contains("GroupId=sg-0new"))
        .respond_with(xml(ACK))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteKeyPair"))
        .and(body_string_contains("KeyName=app-1-0-k3x9-aws-key"))
        .respond_with(xml(ACK))
        .expect(1)
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_instance(&InstanceSpec {
            name: "app-1-0-k3x9-aws".into(),
            machine_class: "t3.micro".into(),
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
async fn failed_launch_keeps_preexisting_group_and_named_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeSecurityGroups"))
        .respond_with(xml(GROUP_ADMIN_ONLY))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=RunInstances"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<Response><Errors><Error><Code>InstanceLimitExceeded</Code>\
             <Message>limit</Message></Error></Errors></Response>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteSecurityGroup"))
        .respond_with(xml(ACK))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteKeyPair"))
        .respond_with(xml(ACK))
        .expect(0)
        .mount(&server)
        .await;

    let result = provider(&server)
        .create_instance(&InstanceSpec {
            name: "app-1-0-k3x9-aws".into(),
            machine_class: "t3.micro".into(),
            base_image: None,
            admin: AdminAccess {
                key_name: Some("deploy".into()),
                public_key: None,
            },
        })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn terminate_deletes_imported_key_and_group() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=TerminateInstances"))
        .respond_with(xml(ACK))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteKeyPair"))
        .and(body_string_contains("KeyName=app-1-0-k3x9-aws-key"))
        .respond_with(xml(ACK))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeInstances"))
        .respond_with(xml(
            r#"<DescribeInstancesResponse><reservationSet><item><instancesSet><item>
  <instanceId>i-0598c7d356eba48d7</instanceId>
  <instanceState><code>48</code><name>terminated</name></instanceState>
  <instanceType>t3.micro</instanceType>
</item></instancesSet></item></reservationSet></DescribeInstancesResponse>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeSecurityGroups"))
        .respond_with(xml(GROUP_ADMIN_ONLY))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteSecurityGroup"))
        .and(body_string_contains("GroupId=sg-0abc"))
        .respond_with(xml(ACK))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .manage_instance_action(&handle(), InstanceAction::Terminate)
        .await
        .unwrap();
}

#[tokio::test]
async fn terminate_tolerates_missing_key_pair() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=TerminateInstances"))
        .respond_with(xml(ACK))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteKeyPair"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<Response><Errors><Error><Code>InvalidKeyPair.NotFound</Code>\
             <Message>The key pair does not exist</Message></Error></Errors></Response>",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeInstances"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<Response><Errors><Error><Code>InvalidInstanceID.NotFound</Code>\
             <Message>gone</Message></Error></Errors></Response>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeSecurityGroups"))
        .respond_with(xml(NO_GROUPS))
        .mount(&server)
        .await;

    provider(&server)
        .manage_instance_action(&handle(), InstanceAction::Terminate)
        .await
        .unwrap();
}
