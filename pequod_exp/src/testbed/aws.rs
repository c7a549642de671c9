use super::{Instance, Provider};
use crate::config::AwsConfig;
use crate::error::ExpError;
use crate::{Host, HostStatus, Role};
use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use rusoto_core::{HttpClient, Region};
use rusoto_credential::DefaultCredentialsProvider;
use rusoto_ec2::{
    CreateTagsRequest, DescribeInstancesRequest, Ec2, Ec2Client, Filter,
    RunInstancesRequest, StartInstancesRequest, StopInstancesRequest, Tag,
    TagSpecification, TerminateInstancesRequest,
};

// every instance the harness manages carries this tag
const HARNESS_TAG: &str = "harness";
const HARNESS_VALUE: &str = "pequod";
const ROLE_TAG: &str = "role";

/// `Provider` backed by the EC2 API.
pub struct Ec2Provider {
    client: Ec2Client,
    config: AwsConfig,
}

impl Ec2Provider {
    pub fn new(config: AwsConfig) -> Result<Self, Report> {
        let region = config
            .region
            .parse::<Region>()
            .wrap_err_with(|| format!("parse region {}", config.region))?;
        let credentials =
            DefaultCredentialsProvider::new().wrap_err("aws credentials")?;
        let client = Ec2Client::new_with(
            HttpClient::new().wrap_err("http client")?,
            credentials,
            region,
        );
        Ok(Self { client, config })
    }

    fn role_tag(role: Role) -> Tag {
        Tag {
            key: Some(ROLE_TAG.to_string()),
            value: Some(role.name().to_string()),
        }
    }

    fn to_instance(instance: rusoto_ec2::Instance) -> Option<Instance> {
        let id = instance.instance_id?;
        let state = instance.state.and_then(|state| state.name);
        let status = match state.as_deref() {
            Some("pending") => HostStatus::Pending,
            Some("running") => HostStatus::Running,
            Some("stopping") | Some("stopped") => HostStatus::Stopped,
            _ => HostStatus::Terminated,
        };
        let role = instance
            .tags
            .unwrap_or_default()
            .into_iter()
            .find(|tag| tag.key.as_deref() == Some(ROLE_TAG))
            .and_then(|tag| tag.value)
            .and_then(|value| value.parse().ok())
            .unwrap_or(Role::None);
        let address = instance.private_ip_address.unwrap_or_default();
        let ssh_address = instance
            .public_dns_name
            .filter(|name| !name.is_empty())
            .or(instance.public_ip_address)
            .unwrap_or_default();
        let mut host = Host::new(Some(id), address, ssh_address, role);
        host.status = status;
        Some(Instance {
            host,
            instance_type: instance.instance_type.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Provider for Ec2Provider {
    async fn instances(&self) -> Result<Vec<Instance>, Report> {
        let filters = vec![
            Filter {
                name: Some(format!("tag:{}", HARNESS_TAG)),
                values: Some(vec![HARNESS_VALUE.to_string()]),
            },
            Filter {
                name: Some("instance-state-name".to_string()),
                values: Some(crate::args![
                    "pending", "running", "stopping", "stopped"
                ]),
            },
        ];
        let mut instances = Vec::new();
        let mut next_token = None;
        loop {
            let request = DescribeInstancesRequest {
                filters: Some(filters.clone()),
                next_token: next_token.take(),
                ..Default::default()
            };
            let result = self
                .client
                .describe_instances(request)
                .await
                .wrap_err("describe instances")?;
            for reservation in result.reservations.unwrap_or_default() {
                instances.extend(
                    reservation
                        .instances
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(Self::to_instance),
                );
            }
            match result.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
        Ok(instances)
    }

    fn instance_type(&self, role: Role) -> String {
        self.config.instance_type(role).to_string()
    }

    async fn start(&self, ids: &[String]) -> Result<(), Report> {
        let request = StartInstancesRequest {
            instance_ids: ids.to_vec(),
            ..Default::default()
        };
        self.client
            .start_instances(request)
            .await
            .wrap_err("start instances")?;
        Ok(())
    }

    async fn allocate(
        &self,
        role: Role,
        count: usize,
    ) -> Result<Vec<String>, Report> {
        let ami = self.config.ami.clone().ok_or_else(|| {
            let reason = "allocating instances needs an --ami".to_string();
            ExpError::InvalidDefinition(reason)
        })?;
        let tags = vec![
            Tag {
                key: Some(HARNESS_TAG.to_string()),
                value: Some(HARNESS_VALUE.to_string()),
            },
            // tagged with the role once running
            Self::role_tag(Role::None),
        ];
        let request = RunInstancesRequest {
            image_id: Some(ami),
            instance_type: Some(self.instance_type(role)),
            key_name: Some(self.config.key_name.clone()),
            security_groups: Some(vec![self.config.security_group.clone()]),
            min_count: count as i64,
            max_count: count as i64,
            tag_specifications: Some(vec![TagSpecification {
                resource_type: Some("instance".to_string()),
                tags: Some(tags),
            }]),
            ..Default::default()
        };
        let reservation = self
            .client
            .run_instances(request)
            .await
            .wrap_err("run instances")?;
        let ids = reservation
            .instances
            .unwrap_or_default()
            .into_iter()
            .filter_map(|instance| instance.instance_id)
            .collect();
        Ok(ids)
    }

    async fn set_role(&self, ids: &[String], role: Role) -> Result<(), Report> {
        let request = CreateTagsRequest {
            resources: ids.to_vec(),
            tags: vec![Self::role_tag(role)],
            ..Default::default()
        };
        self.client
            .create_tags(request)
            .await
            .wrap_err("create tags")?;
        Ok(())
    }

    async fn stop(&self, ids: &[String]) -> Result<(), Report> {
        let request = StopInstancesRequest {
            instance_ids: ids.to_vec(),
            ..Default::default()
        };
        self.client
            .stop_instances(request)
            .await
            .wrap_err("stop instances")?;
        Ok(())
    }

    async fn terminate(&self, ids: &[String]) -> Result<(), Report> {
        let request = TerminateInstancesRequest {
            instance_ids: ids.to_vec(),
            ..Default::default()
        };
        self.client
            .terminate_instances(request)
            .await
            .wrap_err("terminate instances")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_conversion() {
        let instance = rusoto_ec2::Instance {
            instance_id: Some("i-0abc".to_string()),
            instance_type: Some("c5.2xlarge".to_string()),
            private_ip_address: Some("172.31.0.5".to_string()),
            public_dns_name: Some(String::new()),
            public_ip_address: Some("3.3.3.3".to_string()),
            state: Some(rusoto_ec2::InstanceState {
                code: Some(16),
                name: Some("running".to_string()),
            }),
            tags: Some(vec![Ec2Provider::role_tag(Role::Caching)]),
            ..Default::default()
        };
        let instance = Ec2Provider::to_instance(instance).unwrap();
        assert_eq!(instance.id(), "i-0abc");
        assert_eq!(instance.host.role, Role::Caching);
        assert_eq!(instance.host.status, HostStatus::Running);
        assert_eq!(instance.host.address, "172.31.0.5");
        assert_eq!(instance.host.ssh_address, "3.3.3.3");
    }

    #[test]
    fn untagged_is_none() {
        let instance = rusoto_ec2::Instance {
            instance_id: Some("i-1".to_string()),
            state: Some(rusoto_ec2::InstanceState {
                code: Some(80),
                name: Some("stopped".to_string()),
            }),
            ..Default::default()
        };
        let instance = Ec2Provider::to_instance(instance).unwrap();
        assert_eq!(instance.host.role, Role::None);
        assert_eq!(instance.host.status, HostStatus::Stopped);
    }
}
