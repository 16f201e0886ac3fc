//! Prints the operator's CRD manifests to stdout for `kubectl apply -f -`.

use act_runner_controller::crd::{ActDeployment, ActRunner};
use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&ActDeployment::crd()).unwrap());
    print!("---\n{}", serde_yaml::to_string(&ActRunner::crd()).unwrap());
}
