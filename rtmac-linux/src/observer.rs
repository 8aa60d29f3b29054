use std::{fs::Permissions, os::unix::prelude::PermissionsExt, path::Path};

use tokio::{net::UnixStream, task::JoinHandle};

use crate::{
    config::ObservabilityConfig,
    control::{read_json, write_json, ControlRequest, ControlResponse},
    runtime::InstanceHandle,
};

pub async fn spawn(
    config: &ObservabilityConfig,
    instance: InstanceHandle,
) -> JoinHandle<std::io::Result<()>> {
    let config = config.clone();
    tokio::spawn(async move {
        let result = observer(config, instance).await;
        if let Err(ref e) = result {
            tracing::warn!("Abnormal termination of the control socket: {e}");
            tracing::warn!("The control socket will not be available");
        }
        result
    })
}

async fn observer(config: ObservabilityConfig, instance: InstanceHandle) -> std::io::Result<()> {
    let path = match config.control_path {
        Some(path) => path,
        None => return Ok(()),
    };

    // The daemon usually runs as root, but operators should not need
    // elevated permissions to query it
    let permissions: std::fs::Permissions =
        PermissionsExt::from_mode(config.control_permissions);

    let listener = create_unix_socket_with_permissions(&path, permissions)?;

    loop {
        let (stream, _addr) = listener.accept().await?;

        // Waiting for the cycle blocks a connection, not the listener
        let instance = instance.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, instance).await {
                tracing::debug!("Control connection failed: {e}");
            }
        });
    }
}

async fn serve(mut stream: UnixStream, instance: InstanceHandle) -> std::io::Result<()> {
    let mut buffer = Vec::with_capacity(1024);
    let request: ControlRequest = read_json(&mut stream, &mut buffer).await?;
    tracing::debug!("Control request {:?}", request);

    let response = match instance.request(request).await {
        Ok(response) => response,
        Err(error) => ControlResponse::Failed {
            message: error.to_string(),
        },
    };

    write_json(&mut stream, &response).await
}

fn other_error<T>(msg: String) -> std::io::Result<T> {
    use std::io::{Error, ErrorKind};
    Err(Error::new(ErrorKind::Other, msg))
}

pub fn create_unix_socket_with_permissions(
    path: &Path,
    permissions: Permissions,
) -> std::io::Result<tokio::net::UnixListener> {
    let listener = create_unix_socket(path)?;

    std::fs::set_permissions(path, permissions)?;

    Ok(listener)
}

fn create_unix_socket(path: &Path) -> std::io::Result<tokio::net::UnixListener> {
    // must unlink path before the bind below (otherwise we get "address already in use")
    if path.exists() {
        use std::os::unix::fs::FileTypeExt;

        let meta = std::fs::metadata(path)?;
        if !meta.file_type().is_socket() {
            return other_error(format!("path {path:?} exists but is not a socket"));
        }

        std::fs::remove_file(path)?;
    }

    // OS errors are terrible; let's try to do better
    let error = match tokio::net::UnixListener::bind(path) {
        Ok(listener) => return Ok(listener),
        Err(e) => e,
    };

    // we don't create parent directories
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            let msg = format!(
                r"Could not create control socket at {:?} because its parent directory does not exist",
                &path
            );
            return other_error(msg);
        }
    }

    // otherwise, just forward the OS error
    let msg = format!(
        "Could not create control socket at {:?}: {:?}",
        &path, error
    );

    other_error(msg)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rtmac::{config::StationAddr, tdma::TdmaState};

    use super::*;
    use crate::{
        config::Config,
        control::send_request,
        network::MemorySegment,
        runtime::Runtime,
    };

    fn socket_path(name: &str) -> PathBuf {
        // tests run concurrently and need unique socket names
        std::env::temp_dir().join(format!("rtmac-test-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn control_socket_answers_requests() {
        let path = socket_path("control");
        let config: Config = toml::from_str(&format!(
            "station-address = \"02:00:00:00:00:05\"\n[observability]\ncontrol-path = {:?}\ncontrol-permissions = 0o600",
            path
        ))
        .unwrap();

        let segment = MemorySegment::new();
        let (runtime, handle, _upper) =
            Runtime::new(&config, segment.attach(config.station_address));
        tokio::spawn(runtime.run());

        let observer = spawn(&config.observability, handle.clone()).await;
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        match send_request(&path, &ControlRequest::Snapshot).await.unwrap() {
            ControlResponse::Snapshot(snapshot) => {
                assert_eq!(snapshot.station_address, StationAddr([2, 0, 0, 0, 0, 5]));
                assert_eq!(snapshot.state, TdmaState::Down);
            }
            other => panic!("unexpected response {other:?}"),
        }

        let response = send_request(&path, &ControlRequest::BecomeClient).await.unwrap();
        assert_eq!(response, ControlResponse::Done);

        observer.abort();
        handle.shutdown().await.unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn refuses_to_replace_regular_files() {
        let path = socket_path("regular-file");
        std::fs::write(&path, b"not a socket").unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = runtime.block_on(async { create_unix_socket(&path).map(drop) });
        assert!(result.is_err());

        std::fs::remove_file(&path).unwrap();
    }
}
