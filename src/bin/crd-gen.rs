use kube::CustomResourceExt;
use rollgate::crd::experiment::Experiment;
use rollgate::crd::rollout::Rollout;

fn main() -> anyhow::Result<()> {
    // Multi-document YAML, ready for `kubectl apply -f -`
    let documents = [
        serde_yaml::to_string(&Rollout::crd())?,
        serde_yaml::to_string(&Experiment::crd())?,
    ];
    print!("{}", documents.join("---\n"));
    Ok(())
}
