fn main() {
    volume_pipeline::cli::run();
}
