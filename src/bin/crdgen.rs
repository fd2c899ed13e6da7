use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let resources = [gitops_operator::resources::GitopsService::crd()];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource)?);
    }

    Ok(())
}
