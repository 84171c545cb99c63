//! Prints the DevServer CRD manifests as a multi-document YAML stream.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > deploy/crds.yaml
//! ```

use crds::{DevServer, DevServerFlavor, DevServerUser};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [DevServer::crd(), DevServerFlavor::crd(), DevServerUser::crd()];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
