use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions, ImportImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use compute_core::{ComputeError, ContainerRuntime, Result, RuntimeConfig};
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 不可信容器内的执行身份（nobody:nogroup）
const UNTRUSTED_USER: &str = "65534:65534";

/// Docker容器运行时实现
///
/// 所有操作共享同一个daemon连接句柄，可被并发的任务处理器安全
/// 使用；任务间的隔离靠镜像名/目录的命名空间化，容器间隔离由
/// daemon自己保证。
pub struct DockerRuntime {
    docker: Docker,
    timeout: Duration,
}

impl DockerRuntime {
    /// 连接本地Docker daemon并探活
    pub async fn new(config: &RuntimeConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ComputeError::Runtime(format!("创建Docker客户端失败: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| ComputeError::Runtime(format!("Docker daemon探活失败: {e}")))?;

        info!("成功连接到Docker daemon");

        Ok(Self {
            docker,
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    /// 给单个运行时操作套上deadline
    async fn with_deadline<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| {
                ComputeError::Timeout(format!("{what}超过{}s未完成", self.timeout.as_secs()))
            })?
    }

    /// 强制删除容器（连同匿名卷）
    async fn force_remove_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ComputeError::Runtime(format!("删除容器 {container_id} 失败: {e}")))
    }

    /// 把容器日志灌进调试日志，便于排查不可信代码的失败
    async fn drain_container_logs(&self, container_id: &str) {
        let mut logs = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(line) => debug!("[container {}] {}", container_id, line),
                Err(e) => {
                    warn!("读取容器 {} 日志失败: {}", container_id, e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_build(&self, name: &str, build_context: Bytes) -> Result<Bytes> {
        info!("构建镜像: {}", name);

        let options = BuildImageOptions::<String> {
            t: name.to_string(),
            rm: true,
            forcerm: true,
            pull: true,
            ..Default::default()
        };

        let docker = self.docker.clone();
        let name = name.to_string();
        self.with_deadline("镜像构建", async move {
            let mut stream = docker.build_image(options, None, Some(build_context));
            let mut output = BytesMut::new();
            while let Some(info) = stream.next().await {
                let info = info
                    .map_err(|e| ComputeError::Runtime(format!("构建镜像 {name} 失败: {e}")))?;
                if let Some(line) = info.stream {
                    output.extend_from_slice(line.as_bytes());
                }
                if let Some(detail) = info.error {
                    return Err(ComputeError::Runtime(format!(
                        "构建镜像 {name} 失败: {detail}"
                    )));
                }
            }
            debug!("镜像 {} 构建完成，输出 {} 字节", name, output.len());
            Ok(output.freeze())
        })
        .await
    }

    async fn image_load(&self, name: &str, image: Bytes) -> Result<()> {
        info!("加载镜像档案: {}", name);

        let docker = self.docker.clone();
        let name = name.to_string();
        self.with_deadline("镜像加载", async move {
            let mut stream =
                docker.import_image(ImportImageOptions { quiet: true }, image, None);
            while let Some(info) = stream.next().await {
                let info = info
                    .map_err(|e| ComputeError::Runtime(format!("加载镜像 {name} 失败: {e}")))?;
                if let Some(detail) = info.error {
                    return Err(ComputeError::Runtime(format!(
                        "加载镜像 {name} 失败: {detail}"
                    )));
                }
            }
            Ok(())
        })
        .await
    }

    async fn image_unload(&self, name: &str) -> Result<()> {
        let docker = self.docker.clone();
        let name_owned = name.to_string();
        self.with_deadline("镜像卸载", async move {
            docker
                .remove_image(
                    &name_owned,
                    Some(RemoveImageOptions {
                        force: true,
                        noprune: false,
                    }),
                    None,
                )
                .await
                .map_err(|e| ComputeError::Runtime(format!("卸载镜像 {name_owned} 失败: {e}")))?;
            Ok(())
        })
        .await?;

        debug!("镜像 {} 已卸载", name);
        Ok(())
    }

    async fn run_untrusted(
        &self,
        image: &str,
        args: &[String],
        mounts: &HashMap<String, String>,
        auto_remove: bool,
    ) -> Result<String> {
        let container_name = Uuid::new_v4().to_string();
        info!(
            "在不可信容器 {} 中运行 {:?} (镜像: {})",
            container_name, args, image
        );

        let config = untrusted_container_config(image, args, mounts);

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| ComputeError::Runtime(format!("创建容器 {container_name} 失败: {e}")))?;

        for warning in &created.warnings {
            warn!("创建容器 {} 的警告: {}", created.id, warning);
        }

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ComputeError::Runtime(format!("启动容器 {} 失败: {e}", created.id)))?;

        // 等退出，受deadline约束；超时的容器强杀避免占住handler槽位
        let mut wait_stream = self
            .docker
            .wait_container(&created.id, None::<WaitContainerOptions<String>>);
        let wait_outcome = tokio::time::timeout(self.timeout, wait_stream.next()).await;

        let status_code = match wait_outcome {
            Err(_) => {
                warn!("容器 {} 运行超时，强制清理", created.id);
                if let Err(e) = self.force_remove_container(&created.id).await {
                    warn!("清理超时容器失败: {}", e);
                }
                return Err(ComputeError::Timeout(format!(
                    "容器运行超过{}s未退出 (镜像: {image})",
                    self.timeout.as_secs()
                )));
            }
            Ok(None) => {
                if let Err(e) = self.force_remove_container(&created.id).await {
                    warn!("清理容器失败: {}", e);
                }
                return Err(ComputeError::Runtime(format!(
                    "等待容器 {} 退出时流意外结束",
                    created.id
                )));
            }
            Ok(Some(Ok(response))) => response.status_code,
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => {
                if let Err(e) = self.force_remove_container(&created.id).await {
                    warn!("清理容器失败: {}", e);
                }
                return Err(ComputeError::Runtime(format!(
                    "等待容器 {} 退出失败: {e}",
                    created.id
                )));
            }
        };

        self.drain_container_logs(&created.id).await;

        // auto_remove=false只对正常退出生效：失败的容器没人会来快照，
        // 留着就是泄漏
        if auto_remove || status_code != 0 {
            if let Err(e) = self.force_remove_container(&created.id).await {
                warn!("删除容器 {} 失败: {}", created.id, e);
            }
        }

        if status_code != 0 {
            return Err(ComputeError::ContainerExit {
                image: image.to_string(),
                code: status_code,
            });
        }

        info!("不可信容器 {} 正常退出", created.id);
        Ok(created.id)
    }

    async fn snapshot_container(&self, container_id: &str, image_name: &str) -> Result<Bytes> {
        info!("快照容器 {} 为镜像 {}", container_id, image_name);

        let docker = self.docker.clone();
        let container_id_owned = container_id.to_string();
        let image_name_owned = image_name.to_string();
        self.with_deadline("容器快照", async move {
            // 导出容器文件系统
            let mut export = docker.export_container(&container_id_owned);
            let mut container_tar = BytesMut::new();
            while let Some(chunk) = export.next().await {
                let chunk = chunk.map_err(|e| {
                    ComputeError::Runtime(format!(
                        "导出容器 {container_id_owned} 失败: {e}"
                    ))
                })?;
                container_tar.extend_from_slice(&chunk);
            }

            // 导入为新镜像
            let options = CreateImageOptions::<String> {
                from_src: "-".to_string(),
                repo: image_name_owned.clone(),
                ..Default::default()
            };
            let mut import = docker.create_image(Some(options), Some(container_tar.freeze()), None);
            while let Some(info) = import.next().await {
                let info = info.map_err(|e| {
                    ComputeError::Runtime(format!(
                        "导入容器 {container_id_owned} 为镜像 {image_name_owned} 失败: {e}"
                    ))
                })?;
                if let Some(detail) = info.error {
                    return Err(ComputeError::Runtime(format!(
                        "导入镜像 {image_name_owned} 失败: {detail}"
                    )));
                }
            }

            // 把新镜像的档案字节流带回给调用方
            let mut export_image = docker.export_image(&image_name_owned);
            let mut image_tar = BytesMut::new();
            while let Some(chunk) = export_image.next().await {
                let chunk = chunk.map_err(|e| {
                    ComputeError::Runtime(format!(
                        "导出镜像 {image_name_owned} 失败: {e}"
                    ))
                })?;
                image_tar.extend_from_slice(&chunk);
            }
            Ok(image_tar.freeze())
        })
        .await
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.force_remove_container(container_id).await?;
        debug!("容器 {} 已删除", container_id);
        Ok(())
    }
}

/// 不可信容器的配置，安全策略全部收口在这里：断网、非root、
/// 仅调用方显式传入的bind、保留镜像默认entrypoint
fn untrusted_container_config(
    image: &str,
    args: &[String],
    mounts: &HashMap<String, String>,
) -> Config<String> {
    let binds: Vec<String> = mounts
        .iter()
        .map(|(host_path, container_path)| format!("{host_path}:{container_path}"))
        .collect();

    Config {
        image: Some(image.to_string()),
        cmd: Some(args.to_vec()),
        user: Some(UNTRUSTED_USER.to_string()),
        attach_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        open_stdin: Some(false),
        working_dir: Some("/data".to_string()),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            // 自己删容器，保证能先取日志和退出码
            auto_remove: Some(false),
            privileged: Some(false),
            binds: Some(binds),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untrusted_config_enforces_isolation() {
        let mounts = HashMap::from([
            ("/data/m1/test".to_string(), "/true_data/test".to_string()),
            (
                "/data/m1/untargeted_test".to_string(),
                "/pred_data/test".to_string(),
            ),
        ]);
        let args = vec!["-T".to_string(), "detarget".to_string()];
        let config = untrusted_container_config("problem-abc", &args, &mounts);

        // 断网 + 非root + 非特权
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.user.as_deref(), Some(UNTRUSTED_USER));
        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.privileged, Some(false));

        // bind严格等于调用方传入的挂载，无隐式挂载
        let binds = host_config.binds.unwrap();
        assert_eq!(binds.len(), mounts.len());
        for (host, container) in &mounts {
            assert!(binds.contains(&format!("{host}:{container}")));
        }

        // entrypoint不被覆盖，命令来自调用方
        assert!(config.entrypoint.is_none());
        assert_eq!(config.cmd, Some(args));
    }

    #[test]
    fn test_untrusted_config_no_mounts_means_no_binds() {
        let config = untrusted_container_config("model-x", &[], &HashMap::new());
        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.binds, Some(vec![]));
        assert_eq!(config.network_disabled, Some(true));
    }
}
