fn main() -> anyhow::Result<()> {
    itemlog_lib::run()
}
